//! Language detector (C2).
//!
//! Detection only feeds prompt selection and result metadata; it must never
//! act as a retrieval filter. Short or unsupported-language queries degrade
//! to the undetermined tag `"und"` rather than guessing.

use whatlang::{Lang, Script};

const MIN_CONFIDENT_LEN: usize = 15;

/// Closed set of languages the prompt layer has copy for. Anything whatlang
/// detects outside this set degrades to `und`.
const SUPPORTED: &[Lang] = &[
    Lang::Eng,
    Lang::Spa,
    Lang::Fra,
    Lang::Deu,
    Lang::Por,
    Lang::Ita,
    Lang::Nld,
    Lang::Jpn,
    Lang::Cmn,
    Lang::Kor,
    Lang::Rus,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageDetection {
    pub bcp47: String,
    pub iso639_3: String,
    pub confident: bool,
}

impl LanguageDetection {
    fn undetermined() -> Self {
        Self {
            bcp47: "und".to_string(),
            iso639_3: "und".to_string(),
            confident: false,
        }
    }
}

/// Map free text to `{bcp47, iso639_3, confident}`. See module docs: this is
/// metadata only, never a retrieval filter.
pub fn detect(query: &str) -> LanguageDetection {
    let trimmed = query.trim();
    if trimmed.chars().count() < MIN_CONFIDENT_LEN {
        return LanguageDetection::undetermined();
    }

    let Some(info) = whatlang::detect(trimmed) else {
        return LanguageDetection::undetermined();
    };

    if !SUPPORTED.contains(&info.lang()) {
        return LanguageDetection::undetermined();
    }

    // Script-mismatch or low-confidence detections degrade as well: whatlang
    // can report a supported Lang with a reliability score near zero on
    // very short or ambiguous mixed-script input.
    if !info.is_reliable() {
        return LanguageDetection::undetermined();
    }

    LanguageDetection {
        bcp47: bcp47_for(info.lang()).to_string(),
        iso639_3: info.lang().code().to_string(),
        confident: true,
    }
}

fn bcp47_for(lang: Lang) -> &'static str {
    match lang {
        Lang::Eng => "en",
        Lang::Spa => "es",
        Lang::Fra => "fr",
        Lang::Deu => "de",
        Lang::Por => "pt",
        Lang::Ita => "it",
        Lang::Nld => "nl",
        Lang::Jpn => "ja",
        Lang::Cmn => "zh",
        Lang::Kor => "ko",
        Lang::Rus => "ru",
        _ => "und",
    }
}

/// Script helper retained for callers that want a coarse CJK check without
/// paying for full detection (e.g. choosing a tokenizer for snippet display).
pub fn looks_cjk(query: &str) -> bool {
    matches!(
        whatlang::detect_script(query),
        Some(Script::Mandarin) | Some(Script::Hiragana) | Some(Script::Katakana) | Some(Script::Hangul)
    )
}

/// Resolve the prompt language per the orchestrator's precedence rule:
/// explicit hint > explicit retrieval `lang` filter > detection.
pub fn resolve_query_language(
    hint: Option<&str>,
    retrieval_lang_filter: Option<&str>,
    query: &str,
) -> String {
    if let Some(h) = hint {
        return h.to_string();
    }
    if let Some(l) = retrieval_lang_filter {
        return l.to_string();
    }
    detect(query).bcp47
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_query_is_undetermined() {
        let d = detect("hello there");
        assert_eq!(d.bcp47, "und");
        assert_eq!(d.iso639_3, "und");
        assert!(!d.confident);
    }

    #[test]
    fn test_boundary_length_14_is_undetermined() {
        let q = "a".repeat(14);
        assert_eq!(detect(&q).bcp47, "und");
    }

    #[test]
    fn test_confident_english_detection() {
        let d = detect("the quick brown fox jumps over the lazy dog repeatedly");
        assert_eq!(d.bcp47, "en");
        assert!(d.confident);
    }

    #[test]
    fn test_resolve_query_language_hint_wins() {
        let lang = resolve_query_language(Some("fr"), Some("de"), "this is an english sentence");
        assert_eq!(lang, "fr");
    }

    #[test]
    fn test_resolve_query_language_filter_wins_over_detection() {
        let lang = resolve_query_language(None, Some("de"), "this is an english sentence here");
        assert_eq!(lang, "de");
    }

    #[test]
    fn test_resolve_query_language_falls_back_to_detection() {
        let lang = resolve_query_language(None, None, "the quick brown fox jumps over the lazy dog");
        assert_eq!(lang, "en");
    }
}
