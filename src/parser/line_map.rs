use regex::Regex;
use std::collections::HashMap;

/// How many lines of a block item are inspected for a nested `key:` token
/// before giving up on it being a step.
const LOOKAHEAD_LINES: usize = 6;

/// Map flattened step indices to 1-based source line numbers.
///
/// Scans lines after the document's `---` divider (the whole document if
/// there is none) for list items; the first item's indentation defines the
/// top-level step indentation for the rest of the file. An item at that
/// indentation counts as a step if its own line carries a `key:` token, or
/// if one of the following lines (before a sibling item at equal-or-lesser
/// indentation) carries a nested `key:`/`name:`/`flow:`/`file:` token.
/// Steps may be written as a single-line mapping or a multi-line block;
/// both must be recognized.
///
/// The indices assigned here must match the executor's flattened
/// `beforeTest + steps + afterTest` numbering for the same document.
pub fn map_step_lines(source: &str) -> HashMap<usize, usize> {
    let item_re = Regex::new(r"^(\s*)-(?:\s|$)").unwrap();
    let keyed_item_re = Regex::new(r#"^\s*-\s+"?[A-Za-z_][\w.-]*"?\s*:"#).unwrap();
    let nested_key_re = Regex::new(r#"^(\s*)"?[A-Za-z_][\w.-]*"?\s*:"#).unwrap();

    let lines: Vec<&str> = source.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.trim_end() == "---")
        .map(|i| i + 1)
        .unwrap_or(0);

    let mut map = HashMap::new();
    let mut top_indent: Option<usize> = None;
    let mut index = 0usize;

    for i in start..lines.len() {
        let line = lines[i];
        let Some(caps) = item_re.captures(line) else {
            continue;
        };
        let indent = caps.get(1).map_or(0, |m| m.as_str().len());

        let top = *top_indent.get_or_insert(indent);
        if indent != top {
            continue;
        }

        let is_step = if keyed_item_re.is_match(line) {
            true
        } else {
            // Block item: look for a nested key on the continuation lines
            let mut found = false;
            for j in (i + 1)..lines.len().min(i + 1 + LOOKAHEAD_LINES) {
                let next = lines[j];
                if let Some(item) = item_re.captures(next) {
                    let next_indent = item.get(1).map_or(0, |m| m.as_str().len());
                    if next_indent <= indent {
                        break;
                    }
                }
                if let Some(key) = nested_key_re.captures(next) {
                    let key_indent = key.get(1).map_or(0, |m| m.as_str().len());
                    if key_indent > indent {
                        found = true;
                        break;
                    }
                }
            }
            found
        };

        if is_step {
            map.insert(index, i + 1);
            index += 1;
        }
    }

    map
}
