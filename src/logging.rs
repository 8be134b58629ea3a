//! Logging macros shared by the engine layers.
//!
//! Every event carries `operation` plus whichever of `user_id`, `session_id`,
//! `service` and `component` applies, so logs from the HTTP layer, the
//! session services and the store can be joined on the same keys. Each macro
//! expands to a single expression.

// HTTP handlers

#[macro_export]
macro_rules! log_api_start {
    ($operation:expr, user_id = $user_id:expr, session_id = $session_id:expr) => {
        tracing::debug!(
            operation = $operation,
            user_id = %$user_id,
            session_id = %$session_id,
            "Request received"
        )
    };
    ($operation:expr, user_id = $user_id:expr) => {
        tracing::debug!(operation = $operation, user_id = %$user_id, "Request received")
    };
}

#[macro_export]
macro_rules! log_api_success {
    ($operation:expr, session_id = $session_id:expr, $msg:expr) => {
        tracing::info!(operation = $operation, session_id = %$session_id, "Request handled: {}", $msg)
    };
    ($operation:expr, count = $count:expr, $msg:expr) => {
        tracing::info!(operation = $operation, count = $count, "Request handled: {}", $msg)
    };
}

#[macro_export]
macro_rules! log_api_error {
    ($operation:expr, session_id = $session_id:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(
            operation = $operation,
            session_id = %$session_id,
            error = %$error,
            "Request failed: {}", $msg
        )
    };
    ($operation:expr, error = $error:expr, $msg:expr) => {
        tracing::error!(operation = $operation, error = %$error, "Request failed: {}", $msg)
    };
}

#[macro_export]
macro_rules! log_api_warn {
    ($operation:expr, $msg:expr) => {
        tracing::warn!(operation = $operation, "Request degraded: {}", $msg)
    };
}

// Session manager, submission pipeline, mastery

#[macro_export]
macro_rules! log_service_start {
    ($service:expr, $operation:expr, session_id = $session_id:expr, answer_count = $count:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            session_id = %$session_id,
            answer_count = $count,
            "Processing submission"
        )
    };
    ($service:expr, $operation:expr, user_id = $user_id:expr) => {
        tracing::info!(service = $service, operation = $operation, user_id = %$user_id, "Processing request")
    };
}

#[macro_export]
macro_rules! log_service_success {
    ($service:expr, $operation:expr, session_id = $session_id:expr, duration_ms = $duration:expr) => {
        tracing::info!(
            service = $service,
            operation = $operation,
            session_id = %$session_id,
            duration_ms = $duration,
            "Completed {}", $operation
        )
    };
}

#[macro_export]
macro_rules! log_service_error {
    ($service:expr, $operation:expr, session_id = $session_id:expr, error = $error:expr) => {
        tracing::error!(
            service = $service,
            operation = $operation,
            session_id = %$session_id,
            error = %$error,
            "Failed {}", $operation
        )
    };
}

#[macro_export]
macro_rules! log_service_warn {
    ($service:expr, $operation:expr, $msg:expr) => {
        tracing::warn!(service = $service, operation = $operation, "{}", $msg)
    };
}

// Store

#[macro_export]
macro_rules! log_db_operation {
    (debug, $operation:expr, session_id = $session_id:expr, duration_ms = $duration:expr) => {
        tracing::debug!(
            component = "database",
            operation = $operation,
            session_id = %$session_id,
            duration_ms = $duration,
            "Query finished"
        )
    };
    (debug, $operation:expr, count = $count:expr, duration_ms = $duration:expr) => {
        tracing::debug!(
            component = "database",
            operation = $operation,
            rows = $count,
            duration_ms = $duration,
            "Query finished"
        )
    };
    (info, $operation:expr, $msg:expr) => {
        tracing::info!(component = "database", operation = $operation, "{}", $msg)
    };
}

#[macro_export]
macro_rules! log_performance {
    ($operation:expr, duration_ms = $duration:expr, items = $items:expr) => {
        tracing::debug!(
            event_type = "timing",
            operation = $operation,
            duration_ms = $duration,
            items = $items,
            "Batch timing"
        )
    };
}

// Process lifecycle and configuration

#[macro_export]
macro_rules! log_system_event {
    (startup, component = $component:expr, $msg:expr) => {
        tracing::info!(event_type = "startup", component = $component, "{}", $msg)
    };
    (shutdown, component = $component:expr, $msg:expr) => {
        tracing::info!(event_type = "shutdown", component = $component, "{}", $msg)
    };
    (config, $msg:expr) => {
        tracing::info!(event_type = "configuration", "{}", $msg)
    };
}

/// Request-body and configuration checks.
#[macro_export]
macro_rules! log_validation {
    (success, $component:expr, $msg:expr) => {
        tracing::debug!(event_type = "validation", component = $component, result = "success", "Accepted: {}", $msg)
    };
    (failure, $component:expr, error = $error:expr) => {
        tracing::warn!(event_type = "validation", component = $component, result = "failure", error = %$error, "Rejected")
    };
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    #[test]
    fn test_engine_log_macros_expand() {
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let error = anyhow::anyhow!("store unavailable");

        log_api_start!("get_session", user_id = user_id, session_id = session_id);
        log_api_start!("list_sessions", user_id = user_id);
        log_api_success!("submit_session", session_id = session_id, "answers scored");
        log_api_success!("list_sessions", count = 5, "sessions listed");
        log_api_warn!("list_sessions", "serving stale list");
        log_api_error!("create_session", error = error, "session creation failed");
        log_api_error!("submit_session", session_id = session_id, error = "pool closed", "submission failed");

        log_service_start!("submission", "submit_answers", session_id = session_id, answer_count = 3);
        log_service_start!("session_manager", "create_session", user_id = user_id);
        log_service_success!("submission", "submit_answers", session_id = session_id, duration_ms = 10);
        log_service_warn!("mastery", "update_batch", "applied 1 of 2 mastery updates");

        log_db_operation!(debug, "persist_attempts", session_id = session_id, duration_ms = 10);
        log_db_operation!(debug, "list_sessions", count = 2, duration_ms = 3);
        log_db_operation!(info, "migrate", "database initialized");
        log_performance!("evaluate_answers", duration_ms = 25, items = 10);

        log_system_event!(startup, component = "server", "server starting");
        log_system_event!(shutdown, component = "server", "server stopped");
        log_system_event!(config, "configuration loaded");

        log_validation!(success, "submit_request", "2 answers");
        log_validation!(failure, "submit_request", error = "no answers");
    }

    #[test]
    fn test_macros_work_in_expression_position() {
        let session_id = Uuid::new_v4();
        let outcome: Result<(), &str> = Err("locked");
        match outcome {
            Ok(()) => log_api_warn!("discard_session", "nothing to discard"),
            Err(e) => log_service_error!("session_manager", "discard_session", session_id = session_id, error = e),
        }
    }
}
