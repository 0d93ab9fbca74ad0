//! Deterministic "smart default" metadata used when the provider is slow or down.

use rand::Rng;
use serde_json::Value as JsonValue;

use crate::request::MetadataRequest;
use crate::result::GeneratedMetadata;

const MAX_KEYWORDS: usize = 3;
const MIN_KEYWORD_CHARS: usize = 4;

const STOP_WORDS: &[&str] = &[
    "that", "this", "with", "from", "into", "onto", "over", "under", "about", "their", "there",
    "them", "then", "than", "have", "will", "would", "should", "could", "very", "some", "make",
    "video", "para", "sobre", "entre", "como", "pour", "avec", "dans", "sans", "une", "des",
];

struct LocaleTemplates {
    adjectives: &'static [&'static str],
    /// `{adj}`, `{template}` and `{keywords}` are substituted.
    description: &'static str,
    description_plain: &'static str,
    conjunction: &'static str,
}

const EN: LocaleTemplates = LocaleTemplates {
    adjectives: &["Stunning", "Vibrant", "Cinematic", "Captivating", "Dynamic", "Striking"],
    description: "A {adj} {template} video about {keywords}.",
    description_plain: "A {adj} {template} video.",
    conjunction: "and",
};

const ES: LocaleTemplates = LocaleTemplates {
    adjectives: &["Impresionante", "Vibrante", "Cautivador", "Dinámico", "Llamativo"],
    description: "Un video {template} {adj} sobre {keywords}.",
    description_plain: "Un video {template} {adj}.",
    conjunction: "y",
};

const FR: LocaleTemplates = LocaleTemplates {
    adjectives: &["Éclatante", "Vibrante", "Captivante", "Dynamique", "Saisissante"],
    description: "Une vidéo {template} {adj} sur {keywords}.",
    description_plain: "Une vidéo {template} {adj}.",
    conjunction: "et",
};

fn templates_for(locale: &str) -> &'static LocaleTemplates {
    let language = locale
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match language.as_str() {
        "es" => &ES,
        "fr" => &FR,
        _ => &EN,
    }
}

/// Synthesizes title/description from the template name, prompt and parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmartDefaults;

impl SmartDefaults {
    /// Build fallback metadata; the adjective is the only randomized part.
    pub fn synthesize<R: Rng + ?Sized>(request: &MetadataRequest, rng: &mut R) -> GeneratedMetadata {
        let templates = templates_for(&request.locale);
        let adjective = templates.adjectives[rng.gen_range(0..templates.adjectives.len())];
        let template = display_template_name(&request.template_name);
        let keywords = Self::keywords(request, MAX_KEYWORDS);

        let title = match keywords.first() {
            Some(first) => format!("{adjective} {template}: {}", capitalize(first)),
            None => format!("{adjective} {template}"),
        };

        let pattern = if keywords.is_empty() {
            templates.description_plain
        } else {
            templates.description
        };
        let description = pattern
            .replace("{adj}", &adjective.to_lowercase())
            .replace("{template}", &template.to_lowercase())
            .replace("{keywords}", &join_keywords(&keywords, templates.conjunction));

        GeneratedMetadata { title, description }
    }

    pub fn synthesize_default(request: &MetadataRequest) -> GeneratedMetadata {
        Self::synthesize(request, &mut rand::thread_rng())
    }

    /// Distinct keywords from the prompt, then from string-valued parameters.
    pub fn keywords(request: &MetadataRequest, max: usize) -> Vec<String> {
        let parameter_text = request
            .parameters
            .values()
            .filter_map(JsonValue::as_str)
            .collect::<Vec<_>>()
            .join(" ");

        let mut out: Vec<String> = Vec::new();
        for source in [request.prompt.as_str(), parameter_text.as_str()] {
            for word in source.split(|c: char| !c.is_alphanumeric()) {
                if out.len() >= max {
                    return out;
                }
                let word = word.to_lowercase();
                if word.chars().count() < MIN_KEYWORD_CHARS
                    || STOP_WORDS.contains(&word.as_str())
                    || word.chars().all(|c| c.is_ascii_digit())
                    || out.contains(&word)
                {
                    continue;
                }
                out.push(word);
            }
        }
        out
    }
}

fn display_template_name(name: &str) -> String {
    let words: Vec<String> = name
        .split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(capitalize)
        .collect();
    if words.is_empty() {
        "Video".to_string()
    } else {
        words.join(" ")
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn join_keywords(keywords: &[String], conjunction: &str) -> String {
    match keywords {
        [] => String::new(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} {conjunction} {last}", init.join(", ")),
    }
}
