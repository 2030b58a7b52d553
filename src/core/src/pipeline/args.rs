use chrono::Utc;
use serde_json::{Map, Value};

use cbus_protocol::{EngramMessage, MemoryImprint, Role, TapConfig, MESSAGE_PLACEHOLDER};

use crate::storage::message_id;

/// Prepend synthesized memory entries ahead of real history.
///
/// When `imprints` is non-empty the resulting prefix is, in order: the
/// first imprint (the "bootrom") if its text is non-empty, one entry
/// carrying the serialized tool index, then each remaining non-empty
/// imprint. The entries exist only for argument assembly; they are
/// never persisted.
pub fn inject_memory(
    history: Vec<EngramMessage>,
    imprints: &[MemoryImprint],
    index_summary: &str,
    engram_id: Option<&str>,
) -> Vec<EngramMessage> {
    let Some((bootrom, rest)) = imprints.split_first() else {
        return history;
    };
    let mut out = Vec::with_capacity(history.len() + imprints.len() + 1);
    if !bootrom.text.is_empty() {
        out.push(memory_entry(&bootrom.text, engram_id));
    }
    out.push(memory_entry(index_summary, engram_id));
    for imprint in rest {
        if !imprint.text.is_empty() {
            out.push(memory_entry(&imprint.text, engram_id));
        }
    }
    out.extend(history);
    out
}

fn memory_entry(text: &str, engram_id: Option<&str>) -> EngramMessage {
    EngramMessage {
        id: message_id(),
        engram_id: engram_id.unwrap_or_default().to_string(),
        role: Role::Memory,
        text: text.to_string(),
        timestamp: Utc::now().to_rfc3339(),
    }
}

/// Assemble tool arguments from the tap's base args and conversation
/// history (memory entries included).
///
/// With no connected string arg, the base args pass through untouched.
/// With exactly one history entry the string arg becomes its text and
/// the array arg (when configured) empties. With more, the base value
/// of the string arg acts as a template: the placeholder token is
/// substituted with the latest text, a non-empty template without it
/// passes through, and anything else defaults to the latest text; the
/// array arg receives every text but the latest.
pub fn assemble_args(tap: &TapConfig, history: &[EngramMessage]) -> Map<String, Value> {
    let mut args = tap.args.clone();
    let Some(string_arg) = tap.connected_string_arg.as_deref() else {
        return args;
    };
    let Some(latest) = history.last() else {
        return args;
    };

    if history.len() == 1 {
        args.insert(string_arg.to_string(), Value::String(latest.text.clone()));
        if let Some(array_arg) = tap.connected_array_arg.as_deref() {
            args.insert(array_arg.to_string(), Value::Array(Vec::new()));
        }
        return args;
    }

    let assembled = match args.get(string_arg).and_then(Value::as_str) {
        Some(template) if template.contains(MESSAGE_PLACEHOLDER) => {
            template.replace(MESSAGE_PLACEHOLDER, &latest.text)
        }
        Some(template) if !template.is_empty() => template.to_string(),
        _ => latest.text.clone(),
    };
    args.insert(string_arg.to_string(), Value::String(assembled));

    if let Some(array_arg) = tap.connected_array_arg.as_deref() {
        let prior: Vec<Value> = history[..history.len() - 1]
            .iter()
            .map(|m| Value::String(m.text.clone()))
            .collect();
        args.insert(array_arg.to_string(), Value::Array(prior));
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn history(texts: &[&str]) -> Vec<EngramMessage> {
        texts
            .iter()
            .map(|t| EngramMessage {
                id: message_id(),
                engram_id: "c1".into(),
                role: Role::User,
                text: t.to_string(),
                timestamp: Utc::now().to_rfc3339(),
            })
            .collect()
    }

    fn tap_with_template(template: Option<&str>) -> TapConfig {
        let mut tap = TapConfig::direct("http://localhost:8081", "echo");
        tap.connected_string_arg = Some("q".into());
        tap.connected_array_arg = Some("context".into());
        if let Some(t) = template {
            tap.args.insert("q".into(), json!(t));
        }
        tap
    }

    #[test]
    fn template_substitutes_latest_message() {
        let tap = tap_with_template(Some("pre {{cbus_message}} post"));
        let args = assemble_args(&tap, &history(&["a", "b", "c"]));
        assert_eq!(args.get("q"), Some(&json!("pre c post")));
        assert_eq!(args.get("context"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn non_empty_template_without_placeholder_passes_through() {
        let tap = tap_with_template(Some("fixed question"));
        let args = assemble_args(&tap, &history(&["a", "b"]));
        assert_eq!(args.get("q"), Some(&json!("fixed question")));
    }

    #[test]
    fn empty_or_absent_template_defaults_to_latest() {
        let args = assemble_args(&tap_with_template(Some("")), &history(&["a", "b"]));
        assert_eq!(args.get("q"), Some(&json!("b")));

        let args = assemble_args(&tap_with_template(None), &history(&["a", "b"]));
        assert_eq!(args.get("q"), Some(&json!("b")));
    }

    #[test]
    fn single_entry_history_fills_string_and_empties_array() {
        let tap = tap_with_template(Some("pre {{cbus_message}} post"));
        let args = assemble_args(&tap, &history(&["only"]));
        assert_eq!(args.get("q"), Some(&json!("only")));
        assert_eq!(args.get("context"), Some(&json!([])));
    }

    #[test]
    fn empty_history_leaves_base_args_untouched() {
        let tap = tap_with_template(Some("pre {{cbus_message}} post"));
        let args = assemble_args(&tap, &[]);
        assert_eq!(args.get("q"), Some(&json!("pre {{cbus_message}} post")));
        assert!(args.get("context").is_none());
    }

    #[test]
    fn no_connected_string_arg_passes_args_through() {
        let mut tap = TapConfig::direct("http://localhost:8081", "echo");
        tap.args.insert("x".into(), json!(42));
        let args = assemble_args(&tap, &history(&["a", "b"]));
        assert_eq!(args.get("x"), Some(&json!(42)));
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn memory_prefix_order_is_bootrom_index_then_rest() {
        let imprints = vec![
            MemoryImprint { text: "boot".into() },
            MemoryImprint { text: "".into() },
            MemoryImprint { text: "extra".into() },
        ];
        let out = inject_memory(history(&["real"]), &imprints, "{\"idx\":1}", Some("c1"));
        let texts: Vec<&str> = out.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["boot", "{\"idx\":1}", "extra", "real"]);
        assert!(out[..3].iter().all(|m| m.role == Role::Memory));
        assert_eq!(out[3].role, Role::User);
    }

    #[test]
    fn empty_bootrom_is_skipped_but_index_still_injected() {
        let imprints = vec![MemoryImprint { text: "".into() }];
        let out = inject_memory(history(&["real"]), &imprints, "idx", Some("c1"));
        let texts: Vec<&str> = out.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["idx", "real"]);
    }

    #[test]
    fn no_imprints_means_no_injection() {
        let out = inject_memory(history(&["real"]), &[], "idx", Some("c1"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "real");
    }
}
