use futures::future::join_all;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::GenerationError;
use crate::gemini::GenerationGateway;
use crate::models::AdCopyVariant;
use crate::prompts;

/// Arabic source copy submitted for rewriting.
#[derive(Debug, Clone, Deserialize)]
pub struct CopyRequest {
    #[serde(default)]
    pub hook: String,
    #[serde(default)]
    pub offer: String,
    #[serde(default)]
    pub cta: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl CopyRequest {
    /// All three copy fields are required; instructions are checked by the caller since
    /// the public endpoint and the ad workflow treat a blank value differently.
    pub fn validate(&self) -> Result<(), String> {
        if self.hook.trim().is_empty() || self.offer.trim().is_empty() || self.cta.trim().is_empty() {
            return Err("جميع الحقول مطلوبة: hook, offer, cta".to_string());
        }
        Ok(())
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref().filter(|i| !i.trim().is_empty())
    }
}

/// Pull the outermost `{...}` span out of a model reply and parse it as a variant.
pub fn parse_variant(reply: &str) -> Result<AdCopyVariant, GenerationError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &reply[s..=e],
        _ => return Err(GenerationError::OutputParse("Failed to parse AI response as JSON".to_string())),
    };
    serde_json::from_str(json).map_err(|e| GenerationError::OutputParse(e.to_string()))
}

/// Generate up to `batch_size` variants concurrently, keeping whichever succeed.
pub async fn generate_variants(
    gateway: &dyn GenerationGateway,
    request: &CopyRequest,
    instructions: &str,
    batch_size: u32,
) -> Result<Vec<AdCopyVariant>, GenerationError> {
    let prompt = prompts::build_text_prompt(&request.hook, &request.offer, &request.cta, instructions);
    let prompt = prompt.as_str();

    let attempts = (0..batch_size.max(1)).map(|_| async move {
        let reply = gateway.generate_text(prompt).await?;
        parse_variant(&reply)
    });
    let results = join_all(attempts).await;

    let mut variants = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(v) => variants.push(v),
            Err(e) => warn!(error = %e, "copy variant failed"),
        }
    }

    if variants.is_empty() {
        return Err(GenerationError::EmptyOutput("Failed to generate any variations".to_string()));
    }

    info!(requested = batch_size, produced = variants.len(), "copy variants generated");
    Ok(variants)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Replies in turn from a fixed script; `None` entries fail.
    struct Scripted {
        replies: Vec<Option<&'static str>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GenerationGateway for Scripted {
        async fn generate_text(&self, _prompt: &str) -> Result<String, GenerationError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.replies.get(i).copied().flatten() {
                Some(r) => Ok(r.to_string()),
                None => Err(GenerationError::EmptyOutput("down".to_string())),
            }
        }

        async fn generate_image(&self, _prompt: &str) -> Result<String, GenerationError> {
            unreachable!()
        }
    }

    const GOOD: &str = r#"Sure! {"hook_ru":"Х","offer_ru":"О","cta_ru":"Ц","full_copy_ru":"Х О Ц"} hope it helps"#;

    fn request() -> CopyRequest {
        CopyRequest {
            hook: "خطاف".to_string(),
            offer: "عرض".to_string(),
            cta: "اشترك".to_string(),
            instructions: None,
        }
    }

    #[test]
    fn parses_json_wrapped_in_chatter() {
        let v = parse_variant(GOOD).unwrap();
        assert_eq!(v.full_copy_ru, "Х О Ц");
    }

    #[test]
    fn reply_without_json_is_a_parse_error() {
        assert!(matches!(parse_variant("no json here"), Err(GenerationError::OutputParse(_))));
    }

    #[test]
    fn missing_fields_fail_validation() {
        let mut r = request();
        r.cta = "  ".to_string();
        assert!(r.validate().is_err());
        assert!(request().validate().is_ok());
    }

    #[tokio::test]
    async fn keeps_partial_successes() {
        let gateway = Scripted {
            replies: vec![Some(GOOD), None, Some("garbage"), Some(GOOD), None],
            calls: AtomicUsize::new(0),
        };
        let variants = generate_variants(&gateway, &request(), "x", 5).await.unwrap();
        assert_eq!(variants.len(), 2);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn all_failures_are_an_error() {
        let gateway = Scripted {
            replies: vec![None, Some("nope")],
            calls: AtomicUsize::new(0),
        };
        let err = generate_variants(&gateway, &request(), "x", 2).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to generate any variations");
    }
}
