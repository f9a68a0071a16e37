use std::{
    fmt::Display,
    path::Path,
    sync::{LazyLock, RwLock},
};

use nu_ansi_term::Color;
use serde_json::Value;
use stowage_core::{
    error::{ErrorContext, StoreError},
    StoreResult,
};

pub static COLOR: LazyLock<RwLock<bool>> = LazyLock::new(|| RwLock::new(true));

pub struct Colored<T: Display>(pub Color, pub T);

impl<T: Display> Display for Colored<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let color = COLOR.read().map(|color| *color).unwrap_or(false);
        if color {
            write!(f, "{}", self.0.prefix())?;
            self.1.fmt(f)?;
            write!(f, "{}", self.0.suffix())
        } else {
            self.1.fmt(f)
        }
    }
}

pub fn set_color(enabled: bool) {
    if let Ok(mut color) = COLOR.write() {
        *color = enabled;
    }
}

/// Reads a JSON request body from disk.
pub fn read_json(path: &Path) -> StoreResult<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).map_err(|err| {
        StoreError::BadPackageData(format!("{} is not valid JSON: {err}", path.display()))
    })
}
