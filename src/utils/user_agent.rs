/// Parsed client classification for forensic logging. Pure string
/// matching, no I/O: substring tables in rough specificity order, first
/// hit wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub os: Option<String>,
    pub device: String,
    pub bot: Option<String>,
}

const KNOWN_BOTS: &[(&str, &str)] = &[
    ("googlebot", "Googlebot"),
    ("bingbot", "Bingbot"),
    ("duckduckbot", "DuckDuckBot"),
    ("yandexbot", "YandexBot"),
    ("baiduspider", "Baiduspider"),
    ("slurp", "Yahoo Slurp"),
    ("facebookexternalhit", "Facebook"),
    ("twitterbot", "Twitterbot"),
    ("linkedinbot", "LinkedInBot"),
    ("telegrambot", "TelegramBot"),
    ("discordbot", "Discordbot"),
    ("slackbot", "Slackbot"),
    ("ahrefsbot", "AhrefsBot"),
    ("semrushbot", "SemrushBot"),
    ("mj12bot", "MJ12bot"),
    ("petalbot", "PetalBot"),
    ("curl/", "curl"),
    ("wget/", "Wget"),
    ("python-requests", "python-requests"),
    ("go-http-client", "Go-http-client"),
    ("headlesschrome", "HeadlessChrome"),
];

// Order matters: Edge and Opera carry "Chrome" in their UA, Chrome and
// Safari both carry "Safari".
const BROWSERS: &[(&str, &str)] = &[
    ("edg/", "Edge"),
    ("edge/", "Edge"),
    ("opr/", "Opera"),
    ("opera", "Opera"),
    ("samsungbrowser/", "Samsung Internet"),
    ("firefox/", "Firefox"),
    ("chrome/", "Chrome"),
    ("safari/", "Safari"),
    ("msie", "Internet Explorer"),
    ("trident/", "Internet Explorer"),
];

const OSES: &[(&str, &str)] = &[
    ("windows nt 10", "Windows 10"),
    ("windows nt 6.3", "Windows 8.1"),
    ("windows nt 6.1", "Windows 7"),
    ("windows", "Windows"),
    ("iphone os", "iOS"),
    ("ipad", "iPadOS"),
    ("mac os x", "macOS"),
    ("android", "Android"),
    ("cros", "ChromeOS"),
    ("linux", "Linux"),
    ("freebsd", "FreeBSD"),
];

pub fn parse_user_agent(ua: &str) -> ClientInfo {
    let lowered = ua.to_lowercase();

    let bot = KNOWN_BOTS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, name)| name.to_string());

    if let Some(bot_name) = bot {
        return ClientInfo {
            browser: None,
            browser_version: None,
            os: None,
            device: "bot".to_string(),
            bot: Some(bot_name),
        };
    }

    let browser = BROWSERS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(needle, name)| (*needle, name.to_string()));

    let browser_version = browser
        .as_ref()
        .and_then(|(needle, _)| version_after(&lowered, needle));

    let os = OSES
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, name)| name.to_string());

    let device = if lowered.contains("ipad") || lowered.contains("tablet") {
        "tablet"
    } else if lowered.contains("mobile")
        || lowered.contains("iphone")
        || lowered.contains("android")
    {
        "mobile"
    } else {
        "desktop"
    };

    ClientInfo {
        browser: browser.map(|(_, name)| name),
        browser_version,
        os,
        device: device.to_string(),
        bot: None,
    }
}

/// Digits-and-dots token right after a `name/` marker, if any.
fn version_after(lowered: &str, needle: &str) -> Option<String> {
    if !needle.ends_with('/') {
        return None;
    }
    let start = lowered.find(needle)? + needle.len();
    let version: String = lowered[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    #[test]
    fn test_desktop_chrome() {
        let info = parse_user_agent(CHROME_WIN);
        assert_eq!(info.browser.as_deref(), Some("Chrome"));
        assert_eq!(info.browser_version.as_deref(), Some("120.0.0.0"));
        assert_eq!(info.os.as_deref(), Some("Windows 10"));
        assert_eq!(info.device, "desktop");
        assert!(info.bot.is_none());
    }

    #[test]
    fn test_edge_not_misread_as_chrome() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91";
        let info = parse_user_agent(ua);
        assert_eq!(info.browser.as_deref(), Some("Edge"));
    }

    #[test]
    fn test_mobile_safari() {
        let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 \
             (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1";
        let info = parse_user_agent(ua);
        assert_eq!(info.browser.as_deref(), Some("Safari"));
        assert_eq!(info.os.as_deref(), Some("iOS"));
        assert_eq!(info.device, "mobile");
    }

    #[test]
    fn test_bot_classification() {
        let info = parse_user_agent(
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
        );
        assert_eq!(info.bot.as_deref(), Some("Googlebot"));
        assert_eq!(info.device, "bot");
        assert!(info.browser.is_none());

        let info = parse_user_agent("curl/8.4.0");
        assert_eq!(info.bot.as_deref(), Some("curl"));
    }

    #[test]
    fn test_unknown_agent_defaults() {
        let info = parse_user_agent("SomethingNobodyHasHeardOf/1.0");
        assert!(info.browser.is_none());
        assert!(info.os.is_none());
        assert_eq!(info.device, "desktop");
    }
}
