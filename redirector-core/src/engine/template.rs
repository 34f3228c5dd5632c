//! URL construction from server templates.

use url::form_urlencoded;
use url::Url;

use crate::domain::host::HostInstance;
use crate::domain::route::{IpProtocolVersion, ResolvedUrlParams};
use crate::error::{RedirectorError, Result};

/// Query parameter carrying the matched rule name.
pub const RULE_QUERY_PARAM: &str = "rule";

/// Substitute `{protocol}`, `{host}`, `{port}` and `{urn}` in `template`.
///
/// IPv6 is used only when requested and the host has an IPv6 address; the
/// address is bracketed. Returns the URL and the IP version actually used.
pub fn render(
    template: &str,
    host: &HostInstance,
    params: &ResolvedUrlParams,
) -> (String, IpProtocolVersion) {
    let (address, version) = match (params.ip_version, host.ipv6.as_deref()) {
        (IpProtocolVersion::V6, Some(ipv6)) if !ipv6.is_empty() => {
            (format!("[{}]", ipv6.trim_matches(|c: char| c == '[' || c == ']')), IpProtocolVersion::V6)
        }
        _ => (host.ipv4.clone(), IpProtocolVersion::V4),
    };
    let url = substitute(template, &address, params);
    (url, version)
}

/// Substitute every placeholder except `{host}`.
pub fn render_literal(template: &str, params: &ResolvedUrlParams) -> String {
    substitute(template, "{host}", params)
}

fn substitute(template: &str, host: &str, params: &ResolvedUrlParams) -> String {
    template
        .replace("{protocol}", &params.protocol)
        .replace("{port}", &params.port.to_string())
        .replace("{urn}", params.urn.trim_start_matches('/'))
        .replace("{host}", host)
}

/// Append `pairs` as form-encoded query parameters, keeping `url` otherwise
/// byte-for-byte intact.
pub fn append_query<'a, I>(url: &str, pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    let mut any = false;
    for (key, value) in pairs {
        serializer.append_pair(key, value);
        any = true;
    }
    if !any {
        return url.to_string();
    }
    let query = serializer.finish();
    let separator = match url.find('?') {
        Some(i) if i + 1 == url.len() || url.ends_with('&') => "",
        Some(_) => "&",
        None => "?",
    };
    format!("{url}{separator}{query}")
}

/// Reject URLs that do not parse.
pub fn ensure_valid(url: &str) -> Result<()> {
    Url::parse(url)
        .map(|_| ())
        .map_err(|e| RedirectorError::InvalidUrlParams(format!("{url}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(ip_version: IpProtocolVersion) -> ResolvedUrlParams {
        ResolvedUrlParams {
            protocol: "xre".into(),
            port: 10001,
            urn: "/shell".into(),
            ip_version,
        }
    }

    #[test]
    fn test_render_ipv4() {
        let host = HostInstance::new("10.0.0.1", 1);
        let (url, version) = render("{protocol}://{host}:{port}/{urn}", &host, &params(IpProtocolVersion::V4));
        assert_eq!(url, "xre://10.0.0.1:10001/shell");
        assert_eq!(version, IpProtocolVersion::V4);
    }

    #[test]
    fn test_render_ipv6_bracketed() {
        let host = HostInstance::new("10.0.0.1", 1).with_ipv6("fe80::1");
        let (url, version) = render("{protocol}://{host}:{port}/{urn}", &host, &params(IpProtocolVersion::V6));
        assert_eq!(url, "xre://[fe80::1]:10001/shell");
        assert_eq!(version, IpProtocolVersion::V6);
    }

    #[test]
    fn test_render_ipv6_requested_without_address() {
        let host = HostInstance::new("10.0.0.1", 1);
        let (url, version) = render("{protocol}://{host}:{port}/{urn}", &host, &params(IpProtocolVersion::V6));
        assert_eq!(url, "xre://10.0.0.1:10001/shell");
        assert_eq!(version, IpProtocolVersion::V4);
    }

    #[test]
    fn test_append_query() {
        assert_eq!(append_query("http://h:80/", Vec::<(&str, &str)>::new()), "http://h:80/");
        assert_eq!(
            append_query("http://h:80/", [("rule", "stb rule")]),
            "http://h:80/?rule=stb+rule"
        );
        assert_eq!(
            append_query("http://h:80/?a=1", [("rule", "r")]),
            "http://h:80/?a=1&rule=r"
        );
    }

    #[test]
    fn test_ensure_valid() {
        assert!(ensure_valid("xre://10.0.0.1:10001/shell").is_ok());
        assert!(ensure_valid("not a url").is_err());
    }
}
