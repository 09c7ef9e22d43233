use crate::model::{RawOutbound, SubsError};
use serde::Deserialize;

#[derive(Deserialize)]
struct ProxyDoc {
    proxies: Option<Vec<serde_yaml::Value>>,
}

/// Decodes a structured provider document: YAML with a top-level `proxies`
/// array of mappings, each carrying at least `name` and `type`.
pub fn parse(text: &str) -> Result<Vec<RawOutbound>, SubsError> {
    let doc: ProxyDoc = serde_yaml::from_str(text).map_err(|e| SubsError::Parse(e.to_string()))?;
    let entries = doc
        .proxies
        .ok_or_else(|| SubsError::Parse("document must have a `proxies` field".into()))?;

    let mut out = Vec::with_capacity(entries.len());
    for (idx, value) in entries.into_iter().enumerate() {
        let serde_yaml::Value::Mapping(mapping) = value else {
            return Err(SubsError::Parse(format!("proxy {idx} is not a mapping")));
        };
        let name = str_field(&mapping, "name");
        let kind = str_field(&mapping, "type");
        match (name, kind) {
            (Some(name), Some(kind)) => out.push(RawOutbound {
                name,
                kind,
                params: mapping,
            }),
            _ => {
                return Err(SubsError::Parse(format!(
                    "proxy {idx} is missing `name` or `type`"
                )))
            }
        }
    }
    Ok(out)
}

fn str_field(mapping: &serde_yaml::Mapping, key: &str) -> Option<String> {
    mapping.get(key).and_then(|v| v.as_str()).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proxies_array() {
        let doc = r#"
proxies:
  - name: tokyo-1
    type: ss
    server: 1.2.3.4
    port: 8388
    cipher: aes-256-gcm
    password: secret
  - name: osaka-2
    type: trojan
    server: example.com
    port: 443
"#;
        let got = parse(doc).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].name, "tokyo-1");
        assert_eq!(got[0].kind, "ss");
        assert_eq!(got[0].param_str("server"), Some("1.2.3.4"));
        assert_eq!(got[0].param_u64("port"), Some(8388));
        assert_eq!(got[1].name, "osaka-2");
    }

    #[test]
    fn missing_proxies_field_is_an_error() {
        let err = parse("rules:\n  - DOMAIN,example.com,DIRECT\n").unwrap_err();
        assert!(err.to_string().contains("proxies"));
    }

    #[test]
    fn entry_without_type_is_an_error() {
        let doc = "proxies:\n  - name: incomplete\n";
        let err = parse(doc).unwrap_err();
        assert!(err.to_string().contains("proxy 0"));
    }

    #[test]
    fn empty_array_parses_to_no_entries() {
        let got = parse("proxies: []\n").unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn invalid_yaml_is_a_parse_error() {
        assert!(matches!(parse(": : :").unwrap_err(), SubsError::Parse(_)));
    }
}
