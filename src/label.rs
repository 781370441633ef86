//! Hierarchical branch labels
//!
//! Every node carries a human-readable address such as `1`, `1.a`, `1.a.1`
//! or `1.b`. Segments alternate between numerals and letters by depth:
//! children of a letter-terminated label are numbered, children of a
//! digit-terminated label are lettered.

/// Label given to the root node of every conversation.
pub const ROOT_LABEL: &str = "1";

/// Separator between label segments.
pub const SEPARATOR: char = '.';

/// Compute the label for a new child.
///
/// `sibling_count` must be the number of children the parent had *before*
/// the new child is registered, read from the local tree at call time.
pub fn label(parent_label: Option<&str>, sibling_count: usize) -> String {
    let Some(parent) = parent_label else {
        return ROOT_LABEL.to_string();
    };

    if ends_with_letter(parent) {
        format!("{}{}{}", parent, SEPARATOR, sibling_count + 1)
    } else {
        format!("{}{}{}", parent, SEPARATOR, letter_from_index(sibling_count))
    }
}

/// `0 -> a`, `1 -> b`, ... `25 -> z`, then `aa`, `ab`, ... so the label
/// stays letter-terminated and unique past the 26th sibling.
pub fn letter_from_index(index: usize) -> String {
    let mut n = index + 1;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'a' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Depth of a label: the number of separators (`1` is depth 0).
pub fn depth(label: &str) -> usize {
    label.matches(SEPARATOR).count()
}

fn ends_with_letter(label: &str) -> bool {
    label
        .chars()
        .last()
        .map(|c| c.is_ascii_lowercase())
        .unwrap_or(false)
}
