//! Block page rendering (spec §6: substitution variables `{device_name,
//! reason, blocked_url, timestamp}`).

use chrono::{DateTime, Local};

const TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Blocked</title>
</head>
<body>
<h1>This page has been blocked</h1>
<p>Device: {device_name}</p>
<p>Reason: {reason}</p>
<p>URL: {blocked_url}</p>
<p>Time: {timestamp}</p>
</body>
</html>
"#;

pub fn render(device_name: &str, reason: &str, blocked_url: &str, at: DateTime<Local>) -> String {
    TEMPLATE
        .replace("{device_name}", &escape(device_name))
        .replace("{reason}", &escape(reason))
        .replace("{blocked_url}", &escape(blocked_url))
        .replace("{timestamp}", &at.to_rfc3339())
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
