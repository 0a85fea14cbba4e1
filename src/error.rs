use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("bad params: {0}")]
    BadParams(String),

    #[error("invalid score {input:?}: {reason}")]
    Validation { input: String, reason: &'static str },

    #[error("no confirmed template for class {class_id} in {month}/{year}; apply a template first")]
    NoTemplate { class_id: i64, month: u32, year: i32 },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("grid was saved and must be reloaded before further edits")]
    StaleGrid,

    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::BadParams(_) => "bad_params",
            EngineError::Validation { .. } => "validation_failed",
            EngineError::NoTemplate { .. } => "no_template",
            EngineError::NotFound { .. } => "not_found",
            EngineError::StaleGrid => "stale_grid",
            EngineError::Store(_) => "store_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            EngineError::Validation { input, .. } => Some(json!({ "input": input })),
            EngineError::NoTemplate {
                class_id,
                month,
                year,
            } => Some(json!({ "classId": class_id, "month": month, "year": year })),
            EngineError::NotFound { entity, id } => Some(json!({ "entity": entity, "id": id })),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Store(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
