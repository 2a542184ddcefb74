use std::{fs, path::Path};

use super::error::{Error, Result};

// Trait for saving/loading label sequences into/from files
pub trait LabelRecorder {
    fn save(labels: &[u8], file_path: &Path) -> Result<()>;

    fn load(file_path: &Path) -> Result<Vec<u8>>;
}


/// One line of JavaScript, `var labels=[1,4,2,3];`, for pages that pull the
/// labels in with a script tag. The array literal is JSON, so it never
/// contains spaces.
pub struct JsVarRecorder;

const PREFIX: &str = "var labels=";
const SUFFIX: &str = ";\n";

impl JsVarRecorder {
    pub fn render(labels: &[u8]) -> Result<String> {
        Ok(format!("{}{}{}", PREFIX, serde_json::to_string(labels)?, SUFFIX))
    }

    pub fn parse(text: &str) -> Result<Vec<u8>> {
        let literal = text
            .strip_prefix(PREFIX)
            .and_then(|rest| rest.trim_end().strip_suffix(';'))
            .ok_or_else(|| Error::MalformedLabelFile(format!("expected '{}[...];'", PREFIX)))?;
        serde_json::from_str(literal).map_err(|e| Error::MalformedLabelFile(e.to_string()))
    }
}

impl LabelRecorder for JsVarRecorder {
    fn save(labels: &[u8], file_path: &Path) -> Result<()> {
        fs::write(file_path, Self::render(labels)?)?;
        Ok(())
    }

    fn load(file_path: &Path) -> Result<Vec<u8>> {
        Self::parse(&fs::read_to_string(file_path)?)
    }
}
