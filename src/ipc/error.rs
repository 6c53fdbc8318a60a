use crate::aggregate::AggregateError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Failure of a single request; rendered into the error envelope by [`respond`].
#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::FromSqlConversionFailure(_, _, inner) = &e {
            if let Some(agg) = inner.downcast_ref::<AggregateError>() {
                return HandlerErr::new("bad_data", agg.to_string());
            }
        }
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

impl From<AggregateError> for HandlerErr {
    fn from(e: AggregateError) -> Self {
        HandlerErr::new("bad_data", e.to_string())
    }
}

pub fn respond(id: &str, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => {
            tracing::debug!(code = e.code, message = %e.message, "request failed");
            e.response(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shapes() {
        assert_eq!(
            ok("1", json!({ "x": 1 })),
            json!({ "id": "1", "ok": true, "result": { "x": 1 } })
        );
        let e = HandlerErr::conflict("taken")
            .with_details(json!({ "field": "code" }))
            .response("2");
        assert_eq!(
            e,
            json!({
                "id": "2",
                "ok": false,
                "error": { "code": "conflict", "message": "taken", "details": { "field": "code" } }
            })
        );
    }

    #[test]
    fn aggregate_errors_surface_as_bad_data() {
        let e: HandlerErr = AggregateError::UnknownQuestionType("slider".into()).into();
        assert_eq!(e.code, "bad_data");
    }
}
