use keel_core::{normalize_symbol, Decision};
use serde::{Deserialize, Serialize};

use crate::{AdvisorError, AdvisorResult};

/// Model output split into free-text reasoning and the decision list.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AdvisorReply {
    pub reasoning: String,
    pub decisions: Vec<Decision>,
}

/// Extract the JSON decision array from raw model text.
///
/// Code fences are ignored. Everything before the array is kept as the
/// reasoning. Symbols are normalized so `btc` and `BTCUSDT` agree.
pub fn parse_decisions(text: &str) -> AdvisorResult<AdvisorReply> {
    let cleaned = strip_fences(text);
    let (start, end) = find_json_array(&cleaned)
        .ok_or_else(|| AdvisorError::Parse("no JSON decision array in response".into()))?;
    let mut decisions: Vec<Decision> = serde_json::from_str(&cleaned[start..end])
        .map_err(|err| AdvisorError::Parse(err.to_string()))?;
    for decision in &mut decisions {
        decision.symbol = normalize_symbol(&decision.symbol);
    }
    Ok(AdvisorReply {
        reasoning: cleaned[..start].trim().to_string(),
        decisions,
    })
}

fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Byte range of the first balanced top-level `[...]` that parses as an
/// array of objects.
fn find_json_array(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('[') {
        let start = search_from + offset;
        if let Some(end) = matching_bracket(bytes, start) {
            let candidate = text[start + 1..end].trim_start();
            if candidate.starts_with('{') || candidate.starts_with(']') || candidate.is_empty() {
                return Some((start, end + 1));
            }
        }
        search_from = start + 1;
    }
    None
}

fn matching_bracket(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &byte) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}
