use std::collections::BTreeMap;

/// Parse a SIP003 option string such as `obfs=tls;obfs-host=x.com;fast-open`.
///
/// Pairs split on `;` and the first `=`. `k=` and `=v` pairs are dropped;
/// bare keys are kept with an empty value.
pub fn parse_plugin_opts(opts: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for part in opts.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some((k, v)) => {
                let (k, v) = (k.trim(), v.trim());
                if !k.is_empty() && !v.is_empty() {
                    out.insert(k.to_string(), v.to_string());
                }
            }
            None => {
                out.insert(part.to_string(), String::new());
            }
        }
    }
    out
}

/// Canonicalize the shadowsocks plugin name and options.
///
/// `obfs` is the Clash spelling of simple-obfs' `obfs-local`; both come out
/// as `obfs-local` with `obfs`/`obfs-host`/`obfs-uri` keys. Other plugins pass
/// through unchanged.
pub fn normalize_ss_plugin(plugin: &str, opts: &str) -> (String, String) {
    let plugin = plugin.trim();
    let opts = opts.trim();
    if plugin.is_empty() {
        return (String::new(), String::new());
    }

    if plugin.eq_ignore_ascii_case("obfs") || plugin.eq_ignore_ascii_case("obfs-local") {
        let normalized = normalize_obfs_opts(opts).unwrap_or_else(|| opts.to_string());
        return ("obfs-local".to_string(), normalized);
    }

    (plugin.to_string(), opts.to_string())
}

fn normalize_obfs_opts(opts: &str) -> Option<String> {
    let kv = parse_plugin_opts(opts);
    let pick = |primary: &str, alias: &str| -> Option<String> {
        [primary, alias]
            .iter()
            .filter_map(|k| kv.get(*k))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .map(str::to_string)
    };

    let parts: Vec<String> = [
        ("obfs", pick("obfs", "mode")),
        ("obfs-host", pick("obfs-host", "host")),
        ("obfs-uri", pick("obfs-uri", "path")),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.map(|v| format!("{}={}", key, v)))
    .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(";"))
    }
}
