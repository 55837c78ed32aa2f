//! Report printing.

use std::fs::File;
use std::io::Write;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

pub struct Output {
    pub format: OutputFormat,
    pub file: Option<String>,
}

impl Output {
    pub fn new(format: OutputFormat, file: Option<String>) -> Self {
        Self { format, file }
    }

    pub fn render<T: Serialize>(&self, value: &T) -> anyhow::Result<String> {
        Ok(match self.format {
            OutputFormat::Yaml => serde_yaml::to_string(value)?,
            OutputFormat::Json => serde_json::to_string_pretty(value)?,
        })
    }

    /// Writes the value to the output file, or stdout when none is set.
    pub fn write<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        let output = self.render(value)?;
        match &self.file {
            Some(path) => {
                let mut file = File::create(path)?;
                file.write_all(output.as_bytes())?;
            }
            None => println!("{}", output),
        }
        Ok(())
    }
}
