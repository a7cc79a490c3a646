//! Best-effort parsing of the model's free-text reply into structured fields.
//!
//! The model is asked to reply with three labeled sections, in order:
//!
//! ```text
//! **图片描述：**<description>
//! **诗歌：**<optional title line, then poem lines>
//! **分析：**<analysis>
//! ```
//!
//! Model output is free-form, so every section is optional and every miss has
//! a fallback. This module is pure and total: any input string, including an
//! empty one, produces a valid [`ParsedPoem`].

/// Structured view of one model reply.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedPoem {
    pub description: String,
    pub lines: Vec<String>,
    pub title: Option<String>,
    pub analysis: String,
}

/// Substitute description when the model reply has no description section.
pub const DEFAULT_DESCRIPTION: &str = "一幅意境悠远的画面";

/// Substitute analysis when the model reply has no analysis section.
pub const DEFAULT_ANALYSIS: &str = "诗句与画面相映成趣，情景交融，别有一番韵味。";

const DESC_MARKERS: [&str; 2] = ["**图片描述：**", "图片描述："];
const POEM_MARKERS: [&str; 2] = ["**诗歌：**", "诗歌："];
const TITLE_MARKERS: [&str; 2] = ["**标题：**", "标题："];
const ANALYSIS_MARKERS: [&str; 2] = ["**分析：**", "分析："];

/// A promoted title is a short first line without sentence punctuation.
const TITLE_MAX_CHARS: usize = 12;

/// Locate the leftmost occurrence of any marker variant. Returns the byte
/// range `(start_of_marker, end_of_marker)`.
fn find_marker(text: &str, markers: &[&str]) -> Option<(usize, usize)> {
    markers
        .iter()
        .filter_map(|m| text.find(m).map(|pos| (pos, pos + m.len())))
        .min_by_key(|(pos, end)| (*pos, usize::MAX - (end - pos)))
}

/// Extract the section that starts after `markers` and runs until the next
/// marker out of `terminators`, or end of input.
fn section<'a>(text: &'a str, markers: &[&str], terminators: &[&[&str]]) -> Option<&'a str> {
    let (_, content_start) = find_marker(text, markers)?;
    let rest = &text[content_start..];
    let end = terminators
        .iter()
        .filter_map(|t| find_marker(rest, t).map(|(pos, _)| pos))
        .min()
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn non_empty_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.trim_matches('*').trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Whether a line looks like a bare title rather than a verse.
fn looks_like_title(line: &str) -> bool {
    let stripped = line.trim_matches(|c| matches!(c, '《' | '》' | '"' | '“' | '”'));
    stripped.chars().count() <= TITLE_MAX_CHARS
        && !stripped
            .chars()
            .any(|c| matches!(c, '。' | '，' | '！' | '？' | ',' | '.' | '!' | '?'))
}

fn clean_title(raw: &str) -> Option<String> {
    let title = raw
        .trim()
        .trim_matches(|c| matches!(c, '《' | '》' | '"' | '“' | '”'))
        .trim()
        .to_string();
    (!title.is_empty()).then_some(title)
}

/// Parse one raw model reply. Never fails.
///
/// Fallback ladder:
/// - missing description section → [`DEFAULT_DESCRIPTION`]
/// - missing analysis section → [`DEFAULT_ANALYSIS`]
/// - missing poem section → the whole input split into non-empty lines, no
///   title
/// - poem section without a title marker → a short first line is promoted to
///   title and removed from the body
pub fn parse_poem_response(text: &str) -> ParsedPoem {
    let description = section(text, &DESC_MARKERS, &[&POEM_MARKERS, &ANALYSIS_MARKERS])
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());

    let analysis = section(text, &ANALYSIS_MARKERS, &[])
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_ANALYSIS.to_string());

    let (lines, title) = match section(text, &POEM_MARKERS, &[&ANALYSIS_MARKERS]) {
        Some(body) => parse_poem_body(body),
        // No poem marker at all: treat the entire reply as the poem.
        None => (non_empty_lines(text), None),
    };

    ParsedPoem {
        description,
        lines,
        title,
        analysis,
    }
}

fn parse_poem_body(body: &str) -> (Vec<String>, Option<String>) {
    // An explicit title marker wins and its line is excluded from the body.
    if let Some((marker_start, content_start)) = find_marker(body, &TITLE_MARKERS) {
        let after = &body[content_start..];
        let line_end = after.find('\n').unwrap_or(after.len());
        let title = clean_title(&after[..line_end]);

        let mut remainder = String::with_capacity(body.len());
        remainder.push_str(&body[..marker_start]);
        remainder.push_str(&after[line_end..]);
        return (non_empty_lines(&remainder), title);
    }

    let mut lines = non_empty_lines(body);
    if lines.len() > 1 && looks_like_title(&lines[0]) {
        let title = clean_title(&lines.remove(0));
        return (lines, title);
    }
    (lines, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fully_labeled_reply() {
        let text = "**图片描述：**湖面上落日熔金\n**诗歌：**静夜思\n月落乌啼霜满天\n江枫渔火对愁眠\n**分析：**化用古意";
        let parsed = parse_poem_response(text);
        assert_eq!(parsed.description, "湖面上落日熔金");
        assert_eq!(parsed.title.as_deref(), Some("静夜思"));
        assert_eq!(parsed.lines, vec!["月落乌啼霜满天", "江枫渔火对愁眠"]);
        assert_eq!(parsed.analysis, "化用古意");
    }

    #[test]
    fn explicit_title_marker_wins() {
        let text = "**诗歌：**\n**标题：**《山行》\n远上寒山石径斜\n白云生处有人家";
        let parsed = parse_poem_response(text);
        assert_eq!(parsed.title.as_deref(), Some("山行"));
        assert_eq!(parsed.lines, vec!["远上寒山石径斜", "白云生处有人家"]);
        assert_eq!(parsed.description, DEFAULT_DESCRIPTION);
        assert_eq!(parsed.analysis, DEFAULT_ANALYSIS);
    }

    #[test]
    fn unbolded_markers_are_tolerated() {
        let text = "图片描述：一条小路\n诗歌：\n小路弯弯向远方\n分析：朴素直白";
        let parsed = parse_poem_response(text);
        assert_eq!(parsed.description, "一条小路");
        assert_eq!(parsed.lines, vec!["小路弯弯向远方"]);
        assert_eq!(parsed.analysis, "朴素直白");
    }

    #[test]
    fn no_markers_degrades_to_whole_input() {
        let text = "第一行诗句在这里。\n\n第二行诗句在这里。";
        let parsed = parse_poem_response(text);
        assert_eq!(parsed.lines, vec!["第一行诗句在这里。", "第二行诗句在这里。"]);
        assert_eq!(parsed.title, None);
        assert_eq!(parsed.description, DEFAULT_DESCRIPTION);
        assert_eq!(parsed.analysis, DEFAULT_ANALYSIS);
    }

    #[test]
    fn empty_input_is_total() {
        let parsed = parse_poem_response("");
        assert!(parsed.lines.is_empty());
        assert_eq!(parsed.title, None);
        assert!(!parsed.description.is_empty());
        assert!(!parsed.analysis.is_empty());
    }

    #[test]
    fn long_first_line_is_not_promoted() {
        let text = "**诗歌：**\n这一行实在太长了不可能是一个标题而是一句诗\n第二行";
        let parsed = parse_poem_response(text);
        assert_eq!(parsed.title, None);
        assert_eq!(parsed.lines.len(), 2);
    }

    #[test]
    fn single_line_poem_keeps_its_line() {
        let text = "**诗歌：**孤帆远影";
        let parsed = parse_poem_response(text);
        assert_eq!(parsed.title, None);
        assert_eq!(parsed.lines, vec!["孤帆远影"]);
    }
}
