// db-stream-backup/src/backup/naming.rs
use chrono::{DateTime, Local};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::Path;

use crate::config::{BackupJobSpec, Engine};
use crate::errors::BackupError;

const FALLBACK_TEMPLATE: &str = "{prefix}_{engine}_{db_name}_{timestamp}.{ext}";

/// Values a name template can refer to.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub engine: Engine,
    pub database: String,
    pub host: String,
    pub port: u16,
    pub prefix: String,
    pub extension: String,
    pub started: DateTime<Local>,
}

impl RunMetadata {
    pub fn for_job(spec: &BackupJobSpec, extension: &str, started: DateTime<Local>) -> Self {
        Self {
            engine: spec.engine,
            database: spec.database.clone(),
            host: spec.host.clone(),
            port: spec.port,
            prefix: spec.prefix.clone(),
            extension: extension.to_string(),
            started,
        }
    }

    /// Database name as it appears in object names; SQLite uses the file name.
    pub fn db_name(&self) -> String {
        match self.engine {
            Engine::Sqlite => Path::new(&self.database)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.database.clone()),
            _ => self.database.clone(),
        }
    }

    pub fn vars(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("db_type", self.engine.as_str().to_string()),
            ("engine", self.engine.as_str().to_string()),
            ("db_name", self.db_name()),
            ("timestamp", self.started.format("%Y%m%d_%H%M%S").to_string()),
            ("date", self.started.format("%Y-%m-%d").to_string()),
            ("time", self.started.format("%H%M%S").to_string()),
            ("host", self.host.clone()),
            ("port", self.port.to_string()),
            ("prefix", self.prefix.clone()),
            ("ext", self.extension.clone()),
        ])
    }
}

/// Renders object names from `{placeholder}` templates.
///
/// Unknown placeholders are kept literally.
#[derive(Debug, Clone)]
pub struct NameFormatter {
    template: Option<String>,
    placeholder: Regex,
}

impl NameFormatter {
    pub fn new(template: Option<String>) -> Result<Self, BackupError> {
        let placeholder = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .map_err(|e| BackupError::Config(format!("invalid placeholder pattern: {}", e)))?;
        Ok(Self { template, placeholder })
    }

    pub fn render(&self, template: &str, vars: &HashMap<&str, String>) -> String {
        self.placeholder
            .replace_all(template, |caps: &Captures| match vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Object name for a run. A custom template gets the engine extension
    /// appended unless it already ends with it.
    pub fn object_name(&self, meta: &RunMetadata) -> String {
        let vars = meta.vars();
        match self.template.as_deref() {
            None => self.render(FALLBACK_TEMPLATE, &vars),
            Some(template) => {
                let name = self.render(template, &vars);
                let suffix = format!(".{}", meta.extension);
                if name.ends_with(&suffix) {
                    name
                } else {
                    name + &suffix
                }
            }
        }
    }
}
