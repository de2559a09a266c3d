//! `${key}` placeholder substitution
//!
//! A single left-to-right pass over the template. Substituted values are never
//! rescanned, so a value containing `${other}` is inserted literally. Unknown
//! keys are left in place.

use std::collections::HashMap;

const OPEN: &str = "${";
const CLOSE: char = '}';

/// Replace every `${key}` in `template` whose key is present in `variables`
pub fn substitute(template: &str, variables: &HashMap<String, String>) -> String {
    if variables.is_empty() || !template.contains(OPEN) {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];

        let Some(end) = after.find(CLOSE) else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = &after[..end];
        if key.contains(OPEN) {
            // "${a${b}" - the inner placeholder is the real one
            out.push_str(OPEN);
            rest = after;
            continue;
        }

        match variables.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + OPEN.len() + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
