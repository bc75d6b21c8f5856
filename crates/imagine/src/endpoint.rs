pub const DEFAULT_ENDPOINT: &str = "https://image.pollinations.ai";
pub const DEFAULT_IMAGE_SIZE: u32 = 1024;

/// Shown in place of an image whose URL failed to load.
pub const PLACEHOLDER_IMAGE_URL: &str =
    "https://via.placeholder.com/1024x1024?text=Image+Generation+Error";

const DOWNLOAD_FILE_PREFIX: &str = "anuja-ai";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEndpoint {
    pub base_url: String,
    pub width: u32,
    pub height: u32,
    pub nologo: bool,
}

impl Default for ImageEndpoint {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ENDPOINT.to_string(),
            width: DEFAULT_IMAGE_SIZE,
            height: DEFAULT_IMAGE_SIZE,
            nologo: true,
        }
    }
}

impl ImageEndpoint {
    pub fn new(base_url: impl Into<String>, width: u32, height: u32, nologo: bool) -> Self {
        Self {
            base_url: base_url.into(),
            width,
            height,
            nologo,
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        let trimmed = self.base_url.trim().trim_end_matches('/');
        self.base_url = if trimmed.is_empty() {
            DEFAULT_ENDPOINT.to_string()
        } else {
            trimmed.to_string()
        };
        if self.width == 0 {
            self.width = DEFAULT_IMAGE_SIZE;
        }
        if self.height == 0 {
            self.height = DEFAULT_IMAGE_SIZE;
        }
        self
    }

    /// Builds the image URL for `prompt`. The prompt is percent-encoded once and
    /// otherwise passed through untouched, whitespace included.
    pub fn prompt_url(&self, prompt: &str) -> String {
        format!(
            "{}/prompt/{}?width={}&height={}&nologo={}",
            self.base_url,
            urlencoding::encode(prompt),
            self.width,
            self.height,
            self.nologo
        )
    }
}

/// `anuja-ai-{unix millis}.png`
pub fn download_file_name(unix_millis: i64) -> String {
    format!("{DOWNLOAD_FILE_PREFIX}-{unix_millis}.png")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_matches_public_service() {
        let url = ImageEndpoint::default().prompt_url("a cat");
        assert_eq!(
            url,
            "https://image.pollinations.ai/prompt/a%20cat?width=1024&height=1024&nologo=true"
        );
    }

    #[test]
    fn prompt_is_encoded_exactly_once() {
        let prompt = "100% real / sunset?&x=1 ☀";
        let url = ImageEndpoint::default().prompt_url(prompt);

        let encoded = url
            .strip_prefix("https://image.pollinations.ai/prompt/")
            .and_then(|rest| rest.split('?').next())
            .expect("prompt segment present");
        assert!(!encoded.contains(['/', '?', '&', ' ']));
        assert!(encoded.contains("100%25"));
        let decoded = urlencoding::decode(encoded).expect("valid utf-8");
        assert_eq!(decoded, prompt);
    }

    #[test]
    fn blank_base_and_zero_sizes_fall_back_to_defaults() {
        let endpoint = ImageEndpoint::new("  ", 0, 0, false);
        assert_eq!(endpoint.base_url, DEFAULT_ENDPOINT);
        assert_eq!(endpoint.width, DEFAULT_IMAGE_SIZE);
        assert_eq!(endpoint.height, DEFAULT_IMAGE_SIZE);
        assert!(endpoint.prompt_url("x").ends_with("nologo=false"));
    }

    #[test]
    fn trailing_slash_is_not_doubled() {
        let endpoint = ImageEndpoint::new("http://localhost:8080/", 512, 256, true);
        assert_eq!(
            endpoint.prompt_url("x"),
            "http://localhost:8080/prompt/x?width=512&height=256&nologo=true"
        );
    }

    #[test]
    fn download_names_carry_the_timestamp() {
        assert_eq!(download_file_name(1_700_000_000_000), "anuja-ai-1700000000000.png");
    }
}
