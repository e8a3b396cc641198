use crate::models::{Ad, UserSettings};

/// Default copywriting instructions, used when the user has not stored their own.
pub const DEFAULT_RUSSIAN_INSTRUCTIONS: &str = "أنت خبير إعلانات متخصص في اللغة الروسية ومتمرس في الثقافة الروسية.

مهمتك:
- تحويل المدخلات الإعلانية من العربية إلى الروسية بأسلوب إعلاني احترافي
- مراعاة الثقافة الروسية والأسلوب الإعلاني المناسب للجمهور الروسي
- إنتاج نصوص مناسبة لإعلانات تعليم اللغة العربية الموجهة للجمهور الروسي

القواعد:
1. لا تترجم حرفياً - أعد صياغة المحتوى بأسلوب إعلاني روسي طبيعي
2. استخدم عبارات جذابة ومقنعة بالروسية
3. راعِ الفروق الثقافية بين العربية والروسية
4. اجعل النص يبدو وكأنه كُتب أصلاً بالروسية";

pub const DEFAULT_GLOBAL_IMAGE_INSTRUCTIONS: &str = "Create a ready-to-post social media advertisement image in RUSSIAN language.
This is an ad targeting Russian-speaking people, promoting an Arabic language learning course/offer.

Design requirements:
- Professional social media ad layout (1080x1080 square)
- Eye-catching design that a Russian person scrolling social media would stop to read
- Include visual elements related to Arabic language/culture (Arabic calligraphy accents, books, mosque silhouettes, Middle Eastern patterns — as background/decorative elements)
- The mood should feel premium, inviting, and trustworthy
- High contrast between text and background so the Russian copy is perfectly readable
- Color scheme that feels professional and appeals to a Russian audience";

// The skeletons below are structural and never user-editable; only the
// instruction blocks they wrap come from settings.

pub fn build_text_prompt(hook: &str, offer: &str, cta: &str, user_instructions: &str) -> String {
    format!(
        r#"You will be given user instructions and Arabic ad copy inputs (Hook, Offer, CTA).
Follow the user instructions exactly to generate Russian ad copy.

--- USER INSTRUCTIONS ---
{user_instructions}
--- END USER INSTRUCTIONS ---

Arabic inputs:
- Hook: {hook}
- Offer: {offer}
- CTA: {cta}

RESPOND WITH VALID JSON ONLY. No extra text, no markdown, no explanation.
{{
  "hook_ru": "...",
  "offer_ru": "...",
  "cta_ru": "...",
  "full_copy_ru": "..."
}}"#
    )
}

pub fn build_image_prompt(russian_text: &str, style_modifier: &str, user_instructions: &str) -> String {
    format!(
        r#"Generate an ad image. Follow the instructions below exactly.

--- USER INSTRUCTIONS ---
{user_instructions}
--- END USER INSTRUCTIONS ---

THE FOLLOWING RUSSIAN TEXT MUST APPEAR ON THE IMAGE — render it clearly and legibly:
"""
{russian_text}
"""

CRITICAL TEXT RULES:
- The Russian text above MUST be displayed on the image as the main headline/body text
- Render every Russian word correctly with proper Cyrillic characters (А-Я, а-я)
- The text must be large, bold, and easy to read

Visual style: {style_modifier}"#
    )
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Copywriting instructions: stored user setting, else the default.
pub fn effective_text_instructions(settings: Option<&UserSettings>) -> String {
    non_blank(settings.and_then(|s| s.russian_instructions.as_deref()))
        .unwrap_or(DEFAULT_RUSSIAN_INSTRUCTIONS)
        .to_string()
}

/// Image instructions: the ad's own when it overrides the global ones, else the
/// user's global setting, else the default.
pub fn effective_image_instructions(settings: Option<&UserSettings>, ad: Option<&Ad>) -> String {
    if let Some(ad) = ad
        && ad.override_global_image_instructions
        && let Some(own) = non_blank(ad.image_instructions.as_deref())
    {
        return own.to_string();
    }
    non_blank(settings.and_then(|s| s.global_image_instructions.as_deref()))
        .unwrap_or(DEFAULT_GLOBAL_IMAGE_INSTRUCTIONS)
        .to_string()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn ad(instructions: Option<&str>, override_global: bool) -> Ad {
        Ad {
            id: "ad-1".to_string(),
            user_id: "u".to_string(),
            title: "Spring course".to_string(),
            image_instructions: instructions.map(str::to_string),
            override_global_image_instructions: override_global,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn text_prompt_embeds_inputs_and_json_contract() {
        let prompt = build_text_prompt("خطاف", "عرض", "اشترك", "be bold");
        assert!(prompt.contains("- Hook: خطاف"));
        assert!(prompt.contains("be bold"));
        assert!(prompt.contains("\"full_copy_ru\": \"...\""));
    }

    #[test]
    fn image_prompt_ends_with_style() {
        let prompt = build_image_prompt("Учите арабский", "Pop art", "");
        assert!(prompt.contains("Учите арабский"));
        assert!(prompt.ends_with("Visual style: Pop art"));
    }

    #[test]
    fn ad_override_wins_only_when_flag_set_and_text_present() {
        let settings = UserSettings {
            global_image_instructions: Some("global".to_string()),
            ..Default::default()
        };
        assert_eq!(
            effective_image_instructions(Some(&settings), Some(&ad(Some("mine"), true))),
            "mine"
        );
        assert_eq!(
            effective_image_instructions(Some(&settings), Some(&ad(Some("mine"), false))),
            "global"
        );
        assert_eq!(
            effective_image_instructions(Some(&settings), Some(&ad(Some("  "), true))),
            "global"
        );
        assert_eq!(
            effective_image_instructions(None, None),
            DEFAULT_GLOBAL_IMAGE_INSTRUCTIONS
        );
    }

    #[test]
    fn blank_text_setting_falls_back_to_default() {
        let settings = UserSettings {
            russian_instructions: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(effective_text_instructions(Some(&settings)), DEFAULT_RUSSIAN_INSTRUCTIONS);
    }
}
