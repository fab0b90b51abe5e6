use woothee::parser::Parser;

use crate::storage::models::{ClientMetadata, DeviceInfo, DeviceKind};

/// Parse a User-Agent string and extract device information
pub fn parse_user_agent(user_agent: &str) -> DeviceInfo {
    let parser = Parser::new();

    match parser.parse(user_agent) {
        Some(result) => {
            let kind = match result.category {
                "pc" => DeviceKind::Desktop,
                "smartphone" | "mobilephone" => DeviceKind::Mobile,
                "tablet" => DeviceKind::Tablet,
                "crawler" => DeviceKind::Bot,
                _ => DeviceKind::Unknown,
            };

            DeviceInfo {
                browser: normalize_field(result.name),
                browser_version: normalize_field(result.version),
                kind,
                os: normalize_field(result.os),
                os_version: normalize_field(&result.os_version),
            }
        }
        None => DeviceInfo::default(),
    }
}

/// Build session client metadata from whatever the request carried.
///
/// Both inputs are best-effort; missing or blank values are recorded as absent.
pub fn client_metadata(ip_address: Option<String>, user_agent: Option<String>) -> ClientMetadata {
    let user_agent = user_agent.filter(|ua| !ua.trim().is_empty());
    let device = user_agent
        .as_deref()
        .map(parse_user_agent)
        .unwrap_or_default();

    ClientMetadata {
        device,
        ip_address: ip_address.filter(|ip| !ip.trim().is_empty()),
        user_agent,
    }
}

/// Normalize a field value - return None if empty or "UNKNOWN"
fn normalize_field(value: &str) -> Option<String> {
    if value.is_empty() || value == "UNKNOWN" {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chrome_windows() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        let info = parse_user_agent(ua);

        assert_eq!(info.kind, DeviceKind::Desktop);
        assert_eq!(info.browser.as_deref(), Some("Chrome"));
        assert!(info.browser_version.is_some());
        assert_eq!(info.os.as_deref(), Some("Windows 10"));
    }

    #[test]
    fn test_parse_safari_ios() {
        let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
        let info = parse_user_agent(ua);

        assert_eq!(info.kind, DeviceKind::Mobile);
    }

    #[test]
    fn test_parse_bot() {
        let info = parse_user_agent("Googlebot/2.1 (+http://www.google.com/bot.html)");
        assert_eq!(info.kind, DeviceKind::Bot);
    }

    #[test]
    fn test_parse_empty() {
        let info = parse_user_agent("");

        assert_eq!(info.kind, DeviceKind::Unknown);
        assert!(info.os.is_none());
        assert!(info.browser.is_none());
    }

    #[test]
    fn test_client_metadata_drops_blank_values() {
        let meta = client_metadata(Some(" ".to_string()), Some(String::new()));
        assert!(meta.ip_address.is_none());
        assert!(meta.user_agent.is_none());
        assert_eq!(meta.device, DeviceInfo::default());

        let meta = client_metadata(Some("10.0.0.1".to_string()), None);
        assert_eq!(meta.ip_address.as_deref(), Some("10.0.0.1"));
    }
}
