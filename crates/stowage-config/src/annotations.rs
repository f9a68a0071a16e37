use std::any::type_name;

use documented::{Documented, DocumentedFields};
use toml_edit::{Decor, Item, RawString, Table};
use tracing::warn;

use crate::error::{ConfigError, Result};

/// Appends documentation lines as TOML comments to the given `Decor`.
///
/// Each line of `docs` becomes a `# ` comment; blank lines become a bare `#` so paragraphs
/// stay visible in the generated file.
pub fn append_docs_as_toml_comments(decor: &mut Decor, docs: &str) {
    let old_prefix = decor
        .prefix()
        .and_then(RawString::as_str)
        .unwrap_or_default()
        .to_string();

    let comments: String = docs
        .lines()
        .map(|l| {
            if l.is_empty() {
                "#\n".to_string()
            } else {
                format!("# {l}\n")
            }
        })
        .collect();

    let new_prefix = if old_prefix.is_empty() || old_prefix.ends_with('\n') {
        format!("{old_prefix}{comments}")
    } else {
        format!("{old_prefix}\n{comments}")
    };
    decor.set_prefix(new_prefix);
}

/// Annotates a TOML `Table` with the field docs of `T`.
///
/// The struct-level docs of `T` are attached to the table header unless `is_root` is set.
pub fn annotate_toml_table<T>(table: &mut Table, is_root: bool) -> Result<()>
where
    T: Documented + DocumentedFields,
{
    if !is_root {
        append_docs_as_toml_comments(table.decor_mut(), T::DOCS);
    }

    for (mut key_mut, value_item) in table.iter_mut() {
        let key_str = key_mut.get().to_string();
        match T::get_field_docs(&key_str) {
            Ok(docs) => {
                match value_item {
                    Item::None => return Err(ConfigError::UnexpectedTomlItem(key_str)),
                    Item::Value(_) => append_docs_as_toml_comments(key_mut.leaf_decor_mut(), docs),
                    Item::Table(sub_table) => {
                        append_docs_as_toml_comments(sub_table.decor_mut(), docs)
                    }
                    Item::ArrayOfTables(_) => {
                        return Err(ConfigError::UnexpectedTomlItem(key_str));
                    }
                }
            }
            Err(_) => {
                warn!(
                    "Field '{}' found in TOML but not documented on '{}'",
                    key_str,
                    type_name::<T>()
                );
            }
        }
    }

    Ok(())
}
