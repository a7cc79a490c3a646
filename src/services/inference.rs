//! Client for the vision-capable chat-completions endpoint, plus the fixed
//! style catalog and the canned poems substituted when inference fails.

use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const TEMPERATURE: f64 = 0.8;
const MAX_TOKENS: u32 = 1024;

const SYSTEM_PROMPT: &str = "你是一位才华横溢的诗人，擅长根据画面意境创作诗歌。\
请严格按以下格式回复：先以**图片描述：**开头描述画面，\
再以**诗歌：**开头创作诗歌（第一行为标题），最后以**分析：**开头简要赏析。";

/// The four fixed poem styles. Anything unrecognized maps to `Gufeng`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoemStyle {
    Gufeng,
    Xiandai,
    Langman,
    Zheli,
}

impl PoemStyle {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim() {
            "现代" => PoemStyle::Xiandai,
            "浪漫" => PoemStyle::Langman,
            "哲理" => PoemStyle::Zheli,
            // 古风 and anything unrecognized.
            _ => PoemStyle::Gufeng,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            PoemStyle::Gufeng => "古风",
            PoemStyle::Xiandai => "现代",
            PoemStyle::Langman => "浪漫",
            PoemStyle::Zheli => "哲理",
        }
    }

    fn instruction(&self) -> &'static str {
        match self {
            PoemStyle::Gufeng => "一首古风格律诗，用典雅的文言意象，四句，每句七言",
            PoemStyle::Xiandai => "一首现代自由诗，语言平实而意象新颖，四到八行",
            PoemStyle::Langman => "一首浪漫抒情诗，温柔细腻，直抒胸臆，四到八行",
            PoemStyle::Zheli => "一首哲理短诗，凝练克制，以小见大，四到六行",
        }
    }

    /// Canned poem substituted when inference fails for this style.
    pub fn canned(&self) -> &'static CannedPoem {
        match self {
            PoemStyle::Gufeng => &CANNED_GUFENG,
            PoemStyle::Xiandai => &CANNED_XIANDAI,
            PoemStyle::Langman => &CANNED_LANGMAN,
            PoemStyle::Zheli => &CANNED_ZHELI,
        }
    }
}

/// Build the user prompt for a style.
pub fn build_prompt(style: PoemStyle) -> String {
    format!(
        "请欣赏这张图片，为它创作{}。\
先以**图片描述：**简要描述画面，再以**诗歌：**给出作品（第一行为标题），\
最后以**分析：**简要赏析。",
        style.instruction()
    )
}

/// A complete fallback result, keyed by style.
pub struct CannedPoem {
    pub title: &'static str,
    pub lines: [&'static str; 4],
    pub description: &'static str,
    pub analysis: &'static str,
}

static CANNED_GUFENG: CannedPoem = CannedPoem {
    title: "山水清音",
    lines: [
        "远山含黛水含烟",
        "一叶轻舟落照边",
        "莫道风光无觅处",
        "人间处处是诗篇",
    ],
    description: "一幅山水相映、意境悠远的画面",
    analysis: "以山水入诗，借景抒怀，结句由景及理，余韵悠长。",
};

static CANNED_XIANDAI: CannedPoem = CannedPoem {
    title: "光的切片",
    lines: [
        "光落在这里",
        "把寻常的一瞬",
        "裁成一张明信片",
        "寄给未来的自己",
    ],
    description: "光影交错的日常一瞬",
    analysis: "以\"切片\"为眼，将瞬间定格为可寄出的记忆，轻盈而隽永。",
};

static CANNED_LANGMAN: CannedPoem = CannedPoem {
    title: "心动瞬间",
    lines: [
        "你看那画面里藏着春天",
        "每一寸光影都温柔缱绻",
        "愿把此刻折进信笺",
        "随风送到你的身边",
    ],
    description: "温柔光影里藏着春意的画面",
    analysis: "情感真挚直白，以信笺寄情，浪漫气息扑面而来。",
};

static CANNED_ZHELI: CannedPoem = CannedPoem {
    title: "观象",
    lines: [
        "万物静默如谜",
        "一帧亦是一生",
        "看见即是相遇",
        "相遇便有回声",
    ],
    description: "静默中蕴含深意的画面",
    analysis: "由一帧画面推及存在本身，短句层层递进，哲思隽永。",
};

/// Where the image travels to the model: a storage URL, or inline base64.
#[derive(Clone, Debug)]
pub enum ImageRef {
    Url(String),
    DataUri(String),
}

impl ImageRef {
    fn as_url(&self) -> &str {
        match self {
            ImageRef::Url(url) => url,
            ImageRef::DataUri(uri) => uri,
        }
    }

    /// Build an inline data URI from raw bytes.
    pub fn inline(bytes: &[u8], content_type: &str) -> Self {
        use base64::{Engine as _, engine::general_purpose};
        ImageRef::DataUri(format!(
            "data:{};base64,{}",
            content_type,
            general_purpose::STANDARD.encode(bytes)
        ))
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Http(String),
    #[error("inference endpoint returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("inference response was malformed: {0}")]
    Malformed(String),
}

/// Connection settings for the inference endpoint.
#[derive(Clone, Debug)]
pub struct InferenceConfig {
    /// OpenAI-compatible base URL, e.g. `https://api.example.com/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Client for the vision model.
pub struct InferenceClient {
    http: reqwest::Client,
    cfg: InferenceConfig,
}

impl InferenceClient {
    pub fn new(cfg: InferenceConfig) -> Result<Self, InferenceError> {
        let timeout = if cfg.timeout_secs == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            cfg.timeout_secs
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| InferenceError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn model_name(&self) -> &str {
        &self.cfg.model
    }

    /// One chat completion over an image. Returns the raw reply text; the
    /// caller parses it.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        image: &ImageRef,
    ) -> Result<String, InferenceError> {
        let body = json!({
            "model": self.cfg.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": [
                    { "type": "image_url", "image_url": { "url": image.as_url() } },
                    { "type": "text", "text": user },
                ]},
            ],
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
        });

        let url = format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.cfg.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| InferenceError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(InferenceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| InferenceError::Malformed("response had no choices".into()))?;

        debug!(len = content.len(), "inference reply received");
        Ok(content)
    }

    /// Default system prompt for poem generation.
    pub fn system_prompt() -> &'static str {
        SYSTEM_PROMPT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_style_defaults_to_gufeng() {
        assert_eq!(PoemStyle::from_tag("古风"), PoemStyle::Gufeng);
        assert_eq!(PoemStyle::from_tag("现代"), PoemStyle::Xiandai);
        assert_eq!(PoemStyle::from_tag("浪漫"), PoemStyle::Langman);
        assert_eq!(PoemStyle::from_tag("哲理"), PoemStyle::Zheli);
        assert_eq!(PoemStyle::from_tag("haiku"), PoemStyle::Gufeng);
        assert_eq!(PoemStyle::from_tag(""), PoemStyle::Gufeng);
    }

    #[test]
    fn each_style_has_a_distinct_canned_poem() {
        let titles: std::collections::HashSet<&str> = [
            PoemStyle::Gufeng,
            PoemStyle::Xiandai,
            PoemStyle::Langman,
            PoemStyle::Zheli,
        ]
        .iter()
        .map(|s| s.canned().title)
        .collect();
        assert_eq!(titles.len(), 4);
        for style in [
            PoemStyle::Gufeng,
            PoemStyle::Xiandai,
            PoemStyle::Langman,
            PoemStyle::Zheli,
        ] {
            let canned = style.canned();
            assert_eq!(canned.lines.len(), 4);
            assert!(!canned.description.is_empty());
            assert!(!canned.analysis.is_empty());
        }
    }

    #[test]
    fn prompt_mentions_the_expected_markers() {
        let prompt = build_prompt(PoemStyle::Langman);
        assert!(prompt.contains("**图片描述：**"));
        assert!(prompt.contains("**诗歌：**"));
        assert!(prompt.contains("**分析：**"));
    }

    #[test]
    fn inline_image_ref_is_a_data_uri() {
        let ImageRef::DataUri(uri) = ImageRef::inline(b"abc", "image/png") else {
            panic!("expected data uri");
        };
        assert!(uri.starts_with("data:image/png;base64,"));
    }
}
