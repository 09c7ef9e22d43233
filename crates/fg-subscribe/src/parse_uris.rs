//! Fallback decoder for line-oriented share links, the format most
//! subscription services emit when they do not serve a structured document.
//! The whole body may additionally be base64-wrapped.

use crate::model::{RawOutbound, SubsError};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

/// Decodes one URI per line into raw outbound entries. Lines that cannot be
/// understood are skipped; a document yielding nothing at all is an error.
pub fn parse(text: &str) -> Result<Vec<RawOutbound>, SubsError> {
    let body = unwrap_base64(text);
    let mut out = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(entry) = decode_uri(line) {
            out.push(entry);
        }
    }
    if out.is_empty() {
        return Err(SubsError::Empty);
    }
    Ok(out)
}

/// Subscription bodies are frequently the base64 of the actual link list.
/// Accepts standard and url-safe alphabets, padded or not; anything that does
/// not round-trip to UTF-8 link text is passed through untouched.
fn unwrap_base64(text: &str) -> String {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if let Some(decoded) = decode_any_base64(&compact) {
        if decoded.contains("://") {
            return decoded;
        }
    }
    text.to_string()
}

fn decode_uri(line: &str) -> Option<RawOutbound> {
    let (scheme, rest) = line.split_once("://")?;
    match scheme {
        "ss" => decode_ss(rest),
        "trojan" => decode_trojan(rest),
        "socks5" | "socks" => decode_socks(rest),
        "http" | "https" => decode_http(scheme == "https", rest),
        "vmess" => decode_vmess(rest),
        other => {
            tracing::debug!(scheme = other, "skipping unsupported share link");
            None
        }
    }
}

/// `ss://base64(method:password)@host:port#name` or the legacy form with the
/// whole authority base64-wrapped.
fn decode_ss(rest: &str) -> Option<RawOutbound> {
    let (rest, name) = split_fragment(rest);
    let (rest, _query) = split_query(rest);

    let (userinfo, hostport) = match rest.split_once('@') {
        Some((u, h)) => (decode_any_base64(u).unwrap_or_else(|| u.to_string()), h.to_string()),
        None => {
            let decoded = decode_any_base64(rest)?;
            let (u, h) = decoded.split_once('@')?;
            (u.to_string(), h.to_string())
        }
    };
    let (cipher, password) = userinfo.split_once(':')?;
    let (server, port) = split_host_port(&hostport)?;

    let mut params = serde_yaml::Mapping::new();
    let name = name.unwrap_or_else(|| format!("{server}:{port}"));
    insert(&mut params, "name", name.clone());
    insert(&mut params, "type", "ss");
    insert(&mut params, "server", server);
    params.insert("port".into(), port.into());
    insert(&mut params, "cipher", cipher);
    insert(&mut params, "password", password);
    Some(RawOutbound {
        name,
        kind: "ss".into(),
        params,
    })
}

/// `trojan://password@host:port?sni=...#name`
fn decode_trojan(rest: &str) -> Option<RawOutbound> {
    let (rest, name) = split_fragment(rest);
    let (rest, query) = split_query(rest);
    let (password, hostport) = rest.split_once('@')?;
    let (server, port) = split_host_port(hostport)?;

    let mut params = serde_yaml::Mapping::new();
    let name = name.unwrap_or_else(|| format!("{server}:{port}"));
    insert(&mut params, "name", name.clone());
    insert(&mut params, "type", "trojan");
    insert(&mut params, "server", server);
    params.insert("port".into(), port.into());
    insert(&mut params, "password", percent_decode(password));
    if let Some(sni) = query_value(query, "sni") {
        insert(&mut params, "sni", sni);
    }
    Some(RawOutbound {
        name,
        kind: "trojan".into(),
        params,
    })
}

/// `socks5://[user:pass@]host:port#name`
fn decode_socks(rest: &str) -> Option<RawOutbound> {
    let (rest, name) = split_fragment(rest);
    let (rest, _query) = split_query(rest);
    let (auth, hostport) = match rest.split_once('@') {
        Some((a, h)) => (Some(a), h),
        None => (None, rest),
    };
    let (server, port) = split_host_port(hostport)?;

    let mut params = serde_yaml::Mapping::new();
    let name = name.unwrap_or_else(|| format!("{server}:{port}"));
    insert(&mut params, "name", name.clone());
    insert(&mut params, "type", "socks5");
    insert(&mut params, "server", server);
    params.insert("port".into(), port.into());
    if let Some((user, pass)) = auth.and_then(|a| a.split_once(':')) {
        insert(&mut params, "username", percent_decode(user));
        insert(&mut params, "password", percent_decode(pass));
    }
    Some(RawOutbound {
        name,
        kind: "socks5".into(),
        params,
    })
}

/// `http://[user:pass@]host:port#name`; the https scheme marks TLS.
fn decode_http(tls: bool, rest: &str) -> Option<RawOutbound> {
    let (rest, name) = split_fragment(rest);
    let (rest, _query) = split_query(rest);
    let (auth, hostport) = match rest.split_once('@') {
        Some((a, h)) => (Some(a), h),
        None => (None, rest),
    };
    let (server, port) = split_host_port(hostport)?;

    let mut params = serde_yaml::Mapping::new();
    let name = name.unwrap_or_else(|| format!("{server}:{port}"));
    insert(&mut params, "name", name.clone());
    insert(&mut params, "type", "http");
    insert(&mut params, "server", server);
    params.insert("port".into(), port.into());
    params.insert("tls".into(), tls.into());
    if let Some((user, pass)) = auth.and_then(|a| a.split_once(':')) {
        insert(&mut params, "username", percent_decode(user));
        insert(&mut params, "password", percent_decode(pass));
    }
    Some(RawOutbound {
        name,
        kind: "http".into(),
        params,
    })
}

/// `vmess://base64({"ps": ..., "add": ..., "port": ..., "id": ...})`
fn decode_vmess(rest: &str) -> Option<RawOutbound> {
    let decoded = decode_any_base64(rest.trim())?;
    let doc: serde_json::Value = serde_json::from_str(&decoded).ok()?;
    let server = doc.get("add")?.as_str()?.to_string();
    let port = match doc.get("port")? {
        serde_json::Value::String(s) => s.parse::<u16>().ok()?,
        v => u16::try_from(v.as_u64()?).ok()?,
    };
    let uuid = doc.get("id")?.as_str()?.to_string();
    let name = doc
        .get("ps")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{server}:{port}"));

    let mut params = serde_yaml::Mapping::new();
    insert(&mut params, "name", name.clone());
    insert(&mut params, "type", "vmess");
    insert(&mut params, "server", server);
    params.insert("port".into(), port.into());
    insert(&mut params, "uuid", uuid);
    if let Some(aid) = doc.get("aid").and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok())) {
        params.insert("alterId".into(), aid.into());
    }
    if let Some(net) = doc.get("net").and_then(|v| v.as_str()) {
        insert(&mut params, "network", net);
    }
    if doc.get("tls").and_then(|v| v.as_str()) == Some("tls") {
        params.insert("tls".into(), true.into());
    }
    Some(RawOutbound {
        name,
        kind: "vmess".into(),
        params,
    })
}

fn split_fragment(rest: &str) -> (&str, Option<String>) {
    match rest.split_once('#') {
        Some((head, frag)) if !frag.is_empty() => (head, Some(percent_decode(frag))),
        Some((head, _)) => (head, None),
        None => (rest, None),
    }
}

fn split_query(rest: &str) -> (&str, Option<&str>) {
    match rest.split_once('?') {
        Some((head, query)) => (head, Some(query)),
        None => (rest, None),
    }
}

fn query_value(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| percent_decode(v))
}

fn split_host_port(hostport: &str) -> Option<(String, u16)> {
    let hostport = hostport.trim_end_matches('/');
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host.to_string(), port));
    }
    let (host, port) = hostport.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

fn decode_any_base64(s: &str) -> Option<String> {
    let attempts = [
        STANDARD.decode(s),
        STANDARD_NO_PAD.decode(s),
        URL_SAFE.decode(s),
        URL_SAFE_NO_PAD.decode(s),
    ];
    for attempt in attempts {
        if let Ok(bytes) = attempt {
            if let Ok(text) = String::from_utf8(bytes) {
                return Some(text);
            }
        }
    }
    None
}

fn insert(params: &mut serde_yaml::Mapping, key: &str, value: impl Into<serde_yaml::Value>) {
    params.insert(key.into(), value.into());
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
