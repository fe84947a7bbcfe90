use crate::{postgres::ChangeMessage, Result};

pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize(message: &ChangeMessage) -> Result<String> {
        serde_json::to_string(message).map_err(Into::into)
    }
}
