//! dBase column naming.
//!
//! dBase field names hold at most 10 ASCII bytes. Longer or non-ASCII
//! names are shortened, and collisions created by shortening get a
//! numeric suffix (`area_km_su`, `area_km__1`, ...).

use std::collections::BTreeSet;

/// Longest dBase field name.
pub const MAX_FIELD_NAME: usize = 10;

/// Maps each schema column name to a unique dBase-safe name, in order.
#[must_use]
pub fn dbase_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut used: BTreeSet<String> = BTreeSet::new();
    names
        .into_iter()
        .map(|name| {
            let base = sanitize(name);
            let mut candidate = base.clone();
            let mut n = 1u32;
            while !used.insert(candidate.to_ascii_lowercase()) {
                let suffix = format!("_{n}");
                let keep = MAX_FIELD_NAME.saturating_sub(suffix.len());
                candidate = format!("{}{suffix}", &base[..base.len().min(keep)]);
                n += 1;
            }
            if candidate != name {
                log::debug!("Column \"{name}\" written as \"{candidate}\"");
            }
            candidate
        })
        .collect()
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(MAX_FIELD_NAME)
        .collect();
    if cleaned.is_empty() {
        "field".to_string()
    } else {
        cleaned
    }
}
