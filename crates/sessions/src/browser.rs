//! Stale browser page snapshot invalidation.
//!
//! Browser tools return full page DOM snapshots that become stale as soon
//! as the agent navigates again.  Only the most recent snapshot matters;
//! older ones are replaced with a one-line summary to save tokens.

use cadence_domain::message::{Message, Role};

/// Browser tools whose results contain page DOM.
pub const BROWSER_PAGE_TOOLS: &[&str] = &[
    "browser_navigate",
    "browser_click",
    "browser_get_content",
    "browser_new_tab",
];

pub fn is_browser_page_tool(name: &str) -> bool {
    BROWSER_PAGE_TOOLS.contains(&name)
}

/// Whether content looks like a browser page DOM snapshot.
pub fn is_browser_page_content(content: &str) -> bool {
    if content.starts_with("Page:") {
        return true;
    }
    let mut end = content.len().min(500);
    while end < content.len() && !content.is_char_boundary(end) {
        end += 1;
    }
    content[..end].contains("[Interactive Elements]")
}

/// Extract a short `Page: "..." URL: ...` summary from browser tool output.
pub fn extract_page_header(content: &str) -> String {
    let re = page_header_re();
    if let Some(caps) = re.captures(content) {
        let title = caps.name("title").map(|m| m.as_str()).unwrap_or("");
        let url = caps.name("url").map(|m| m.as_str()).unwrap_or("");
        if !title.is_empty() || !url.is_empty() {
            return format!("Page: \"{title}\" URL: {url}").trim_end().to_string();
        }
    }
    // Fallback: first line, truncated.
    let first_line = content.lines().next().unwrap_or("");
    let end = first_line
        .char_indices()
        .nth(120)
        .map(|(i, _)| i)
        .unwrap_or(first_line.len());
    first_line[..end].to_string()
}

fn page_header_re() -> regex::Regex {
    regex::Regex::new(r#"(?m)^(?:Page:\s*"(?P<title>[^"]*)")?\s*(?:URL:\s*(?P<url>\S+))?"#)
        .expect("page header regex")
}

/// Replace older browser page snapshots with short summaries, keeping the
/// most recent one intact.  Returns the number of messages replaced.
pub fn invalidate_stale_snapshots(history: &mut [Message]) -> usize {
    let mut replaced = 0;
    let mut seen_latest = false;

    for msg in history.iter_mut().rev() {
        if msg.role != Role::Tool || !is_browser_page_content(&msg.content) {
            continue;
        }
        if !seen_latest {
            seen_latest = true;
            continue;
        }
        let summary = extract_page_header(&msg.content);
        msg.content = format!("[Stale page snapshot replaced] {summary}");
        replaced += 1;
    }

    replaced
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(url: &str) -> String {
        format!(
            "Page: \"Example\" URL: {url}\n[Interactive Elements]\nbutton#go\n\nlots of text"
        )
    }

    #[test]
    fn detects_page_content() {
        assert!(is_browser_page_content(&snapshot("https://a.example")));
        assert!(is_browser_page_content(
            "preamble [Interactive Elements] more"
        ));
        assert!(!is_browser_page_content("plain tool output"));
    }

    #[test]
    fn header_extraction() {
        let header = extract_page_header(&snapshot("https://a.example"));
        assert_eq!(header, "Page: \"Example\" URL: https://a.example");
    }

    #[test]
    fn header_fallback_is_first_line() {
        let header = extract_page_header("no structured header here\nsecond line");
        assert_eq!(header, "no structured header here");
    }

    #[test]
    fn only_latest_snapshot_survives() {
        let mut history = vec![
            Message::user("go to a"),
            Message::tool_result("c1", "browser_navigate", snapshot("https://a.example")),
            Message::user("go to b"),
            Message::tool_result("c2", "browser_navigate", snapshot("https://b.example")),
        ];
        let replaced = invalidate_stale_snapshots(&mut history);
        assert_eq!(replaced, 1);
        assert!(history[1].content.starts_with("[Stale page snapshot replaced]"));
        assert!(history[1].content.contains("https://a.example"));
        assert!(history[3].content.starts_with("Page:"));
    }

    #[test]
    fn non_snapshot_tool_results_untouched() {
        let mut history = vec![
            Message::tool_result("c1", "bash", "file listing"),
            Message::tool_result("c2", "browser_navigate", snapshot("https://a.example")),
        ];
        assert_eq!(invalidate_stale_snapshots(&mut history), 0);
        assert_eq!(history[0].content, "file listing");
    }
}
