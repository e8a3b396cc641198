use serde::Serialize;

/// A visual style an ad image can be rendered in.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdStyle {
    pub id: &'static str,
    pub name: &'static str,
    pub name_ar: &'static str,
    pub prompt_modifier: &'static str,
}

pub const AD_STYLES: &[AdStyle] = &[
    AdStyle {
        id: "cartoon",
        name: "Cartoon",
        name_ar: "رسوم كرتونية ملونة",
        prompt_modifier: "Colorful cartoon illustration style, fun and playful characters, bright colors, hand-drawn feel",
    },
    AdStyle {
        id: "realistic",
        name: "Realistic Photo",
        name_ar: "صورة واقعية",
        prompt_modifier: "Photorealistic style, high-quality stock photo look, natural lighting, professional photography",
    },
    AdStyle {
        id: "flat",
        name: "Flat Design",
        name_ar: "تصميم مسطح",
        prompt_modifier: "Modern flat design style, clean geometric shapes, minimal shadows, bold solid colors",
    },
    AdStyle {
        id: "3d",
        name: "3D Render",
        name_ar: "تصميم ثلاثي الأبعاد",
        prompt_modifier: "3D rendered style, glossy materials, soft lighting, modern 3D graphics, depth and dimension",
    },
    AdStyle {
        id: "watercolor",
        name: "Watercolor",
        name_ar: "ألوان مائية",
        prompt_modifier: "Watercolor painting style, soft blending colors, artistic brush strokes, elegant and delicate",
    },
    AdStyle {
        id: "minimalist",
        name: "Minimalist",
        name_ar: "بسيط ونظيف",
        prompt_modifier: "Minimalist design, lots of white space, simple clean elements, elegant simplicity",
    },
    AdStyle {
        id: "pop-art",
        name: "Pop Art",
        name_ar: "فن بوب ملون",
        prompt_modifier: "Pop art style, bold outlines, halftone dots, vibrant contrasting colors, Roy Lichtenstein inspired",
    },
    AdStyle {
        id: "vintage",
        name: "Vintage/Retro",
        name_ar: "ستايل كلاسيكي",
        prompt_modifier: "Vintage retro style, muted warm colors, aged texture, nostalgic feel, classic typography aesthetic",
    },
    AdStyle {
        id: "neon",
        name: "Neon/Cyberpunk",
        name_ar: "نيون وألوان ساطعة",
        prompt_modifier: "Neon cyberpunk style, glowing neon lights, dark background, futuristic, electric blue and pink colors",
    },
    AdStyle {
        id: "isometric",
        name: "Isometric",
        name_ar: "تصميم أيزومتري",
        prompt_modifier: "Isometric illustration style, 3D isometric perspective, clean lines, geometric precision, modern tech feel",
    },
];

pub fn find_style(id: &str) -> Option<&'static AdStyle> {
    AD_STYLES.iter().find(|s| s.id == id)
}
