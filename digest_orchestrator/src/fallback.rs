//! Deterministic stand-in output for stages whose agent is unavailable.
//!
//! Everything here is pure and bounded: inputs are truncated before use, so
//! the cost of a fallback does not grow with the context it is given.

use serde_json::{json, Value};

use crate::context::{Stage, StagePayload};

pub const DEFAULT_TOPICS: [&str; 2] = ["technology", "business"];

const MAX_ARTICLES: usize = 20;
const MAX_TOPICS: usize = 5;
const MAX_SECTIONS: usize = 4;
const ARTICLES_PER_SECTION: usize = 2;
const MAX_TEXT_CHARS: usize = 2_000;

const CATEGORIES: [(&str, &[&str]); 5] = [
    ("Tech News", &["technology", "tech", "ai", "artificial intelligence", "software", "hardware"]),
    ("Business Updates", &["business", "company", "startup", "funding", "investment", "market"]),
    ("Innovation Spotlight", &["innovation", "breakthrough", "discovery", "research", "development"]),
    ("Industry Analysis", &["analysis", "report", "study", "trends", "outlook", "forecast"]),
    ("Science & Research", &["science", "research", "study", "experiment", "scientific"]),
];

/// Minimal valid output for `stage`. Never fails.
pub fn fallback(stage: Stage, view: &Value) -> StagePayload {
    let payload = match stage {
        Stage::Discovering => discovering(view),
        Stage::RetrievingPreferences => retrieving_preferences(view),
        Stage::Drafting => drafting(view),
        Stage::Enhancing => enhancing(view),
        Stage::Formatting => formatting(view),
    };
    payload
        .with_meta("fallback", true)
        .with_meta("stage", stage.key())
}

/// Keyword category for an article title.
pub fn categorize(title: &str) -> &'static str {
    let lower = title.to_lowercase();
    let words: Vec<&str> = lower.split(|c: char| !c.is_alphanumeric()).collect();
    for (category, keywords) in CATEGORIES {
        let hit = keywords.iter().any(|keyword| {
            if keyword.contains(' ') {
                lower.contains(keyword)
            } else {
                words.contains(keyword)
            }
        });
        if hit {
            return category;
        }
    }
    "General"
}

/// First two sentences, or the first 200 characters.
pub fn basic_summary(text: &str) -> String {
    let text = truncate_chars(text.trim(), MAX_TEXT_CHARS);
    if text.is_empty() {
        return "No content available for summary.".to_string();
    }
    let sentences: Vec<&str> = text.split(". ").collect();
    if sentences.len() >= 2 {
        let joined = sentences[..2].join(". ");
        if joined.ends_with('.') {
            joined
        } else {
            format!("{}.", joined)
        }
    } else if text.chars().count() > 200 {
        format!("{}...", truncate_chars(&text, 200))
    } else {
        text
    }
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn slug(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Topics for the run: explicit request topics, then the profile ranking,
/// then the defaults.
pub fn topics_from_view(view: &Value) -> Vec<String> {
    let requested: Vec<String> = view["request"]["topics"]
        .as_array()
        .map(|topics| {
            topics
                .iter()
                .take(MAX_TOPICS)
                .filter_map(Value::as_str)
                .map(|t| truncate_chars(t, 64))
                .collect()
        })
        .unwrap_or_default();
    if !requested.is_empty() {
        return requested;
    }

    if let Some(weights) = view["profile"]["weights"].as_object() {
        let mut ranked: Vec<(&String, f64)> = weights
            .iter()
            .take(64)
            .map(|(topic, weight)| (topic, weight.as_f64().unwrap_or(0.0)))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        let ranked: Vec<String> = ranked
            .into_iter()
            .take(MAX_TOPICS)
            .map(|(topic, _)| truncate_chars(topic, 64))
            .collect();
        if !ranked.is_empty() {
            return ranked;
        }
    }

    DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect()
}

/// Discovered articles visible in the view, capped.
pub fn articles_from_view(view: &Value) -> Vec<Value> {
    view["stages"]["discovering"]["metadata"]["articles"]
        .as_array()
        .map(|articles| articles.iter().take(MAX_ARTICLES).cloned().collect())
        .unwrap_or_default()
}

fn article_title(article: &Value) -> String {
    truncate_chars(article["title"].as_str().unwrap_or("Untitled"), 200)
}

/// Group articles into category sections, in first-seen order.
pub fn sections_from_articles(articles: &[Value]) -> Vec<Value> {
    let mut sections: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for article in articles.iter().take(MAX_ARTICLES) {
        let title = article_title(article);
        let category = categorize(&title);
        let entry = json!({
            "title": title,
            "url": article["url"].as_str().unwrap_or_default(),
            "summary": basic_summary(article["summary"].as_str().unwrap_or_default()),
        });
        match sections.iter_mut().find(|(name, _)| *name == category) {
            Some((_, items)) => items.push(entry),
            None => sections.push((category, vec![entry])),
        }
    }
    sections
        .into_iter()
        .map(|(title, articles)| json!({ "title": title, "articles": articles }))
        .collect()
}

/// Markdown mindmap skeleton over the digest structure.
pub fn mindmap_markdown(
    title: &str,
    topics: &[String],
    sections: &[Value],
    article_count: usize,
    summary: Option<&str>,
) -> String {
    let mut lines = vec![format!("# {}", truncate_chars(title, 120)), String::new()];
    lines.push("## Main Topics".to_string());
    for topic in topics.iter().take(MAX_TOPICS) {
        lines.push(format!("### {}", title_case(topic)));
    }

    if !sections.is_empty() {
        lines.push(String::new());
        lines.push("## Content Sections".to_string());
        for section in sections.iter().take(MAX_SECTIONS) {
            lines.push(format!("### {}", section["title"].as_str().unwrap_or("Section")));
            let articles = section["articles"].as_array().map(Vec::as_slice).unwrap_or(&[]);
            for article in articles.iter().take(ARTICLES_PER_SECTION) {
                if let Some(title) = article["title"].as_str() {
                    lines.push(format!("#### {}...", truncate_chars(title, 40)));
                }
            }
        }
    }

    lines.push(String::new());
    lines.push("## Key Insights".to_string());
    lines.push(format!("### {} Articles Analyzed", article_count));
    lines.push(format!("### {} Topics Covered", topics.len()));
    if let Some(summary) = summary.filter(|s| !s.is_empty()) {
        lines.push(format!("### {}...", truncate_chars(summary, 50)));
    }
    lines.join("\n")
}

fn discovering(view: &Value) -> StagePayload {
    let topics = topics_from_view(view);
    let articles: Vec<Value> = topics
        .iter()
        .map(|topic| {
            let title = format!("{} roundup", title_case(topic));
            json!({
                "title": title,
                "url": format!("fallback://topic/{}", slug(topic)),
                "summary": format!("Catch up on recent {} coverage.", topic),
                "topic": topic,
                "category": categorize(&title),
                "source": "fallback",
            })
        })
        .collect();
    StagePayload::new(format!("Topic roundups for {}", topics.join(", ")))
        .with_meta("articles", articles)
        .with_meta("topics", topics)
}

fn retrieving_preferences(view: &Value) -> StagePayload {
    let topics = topics_from_view(view);
    StagePayload::new(format!("Preferred topics: {}", topics.join(", ")))
        .with_meta("topics", topics)
        .with_meta("related", Vec::<Value>::new())
}

fn draft_title(view: &Value) -> String {
    match view["request"]["custom_prompt"].as_str() {
        Some(prompt) if !prompt.trim().is_empty() => {
            format!("Custom Digest: {}", title_case(&truncate_chars(prompt.trim(), 50)))
        }
        _ => "Personalized Digest".to_string(),
    }
}

fn drafting(view: &Value) -> StagePayload {
    let articles = articles_from_view(view);
    let sections = sections_from_articles(&articles);
    let title = draft_title(view);

    let mut body = vec![format!("# {}", title)];
    if sections.is_empty() {
        body.push("No articles were available for this digest.".to_string());
    }
    for section in &sections {
        body.push(format!("## {}", section["title"].as_str().unwrap_or("Section")));
        for article in section["articles"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
            body.push(format!(
                "- {}: {}",
                article["title"].as_str().unwrap_or_default(),
                article["summary"].as_str().unwrap_or_default()
            ));
        }
    }

    StagePayload::new(body.join("\n"))
        .with_meta("title", title)
        .with_meta("sections", sections)
        .with_meta("topics", topics_from_view(view))
}

fn enhancing(view: &Value) -> StagePayload {
    let drafting = &view["stages"]["drafting"]["metadata"];
    let title = truncate_chars(drafting["title"].as_str().unwrap_or("Digest Mindmap"), 120);
    let sections: Vec<Value> = drafting["sections"]
        .as_array()
        .map(|s| s.iter().take(MAX_SECTIONS).cloned().collect())
        .unwrap_or_default();
    let topics = topics_from_view(view);
    let article_count = sections
        .iter()
        .map(|s| s["articles"].as_array().map(Vec::len).unwrap_or(0))
        .sum();

    let mindmap = mindmap_markdown(&title, &topics, &sections, article_count, None);
    StagePayload::new(format!("Mindmap for {}", title)).with_meta("mindmap", mindmap)
}

fn formatting(view: &Value) -> StagePayload {
    let drafting = &view["stages"]["drafting"];
    let title = truncate_chars(
        drafting["metadata"]["title"].as_str().unwrap_or("Personalized Digest"),
        120,
    );
    let body = truncate_chars(drafting["body"].as_str().unwrap_or_default(), MAX_TEXT_CHARS * 4);
    StagePayload::new(body)
        .with_meta("subject_lines", vec![format!("Your {}", title)])
        .with_meta("format", "text")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_every_stage_validates_on_empty_context() {
        for stage in Stage::ALL {
            let payload = fallback(stage, &json!({}));
            stage.validate(&payload).unwrap();
            assert_eq!(payload.metadata["fallback"], true);
        }
        let discovered = fallback(Stage::Discovering, &json!({}));
        assert_eq!(discovered.get_array("articles").unwrap().len(), 2);
    }

    #[test]
    fn test_bounded_on_oversized_context() {
        let articles: Vec<Value> = (0..50_000)
            .map(|i| json!({"title": format!("AI report {}", i), "summary": "x".repeat(500)}))
            .collect();
        let view = json!({
            "request": {"custom_prompt": "p".repeat(100_000), "topics": []},
            "stages": {
                "discovering": {"body": "", "metadata": {"articles": articles}},
                "drafting": {"body": "b".repeat(1_000_000), "metadata": {"title": "t", "sections": []}},
            },
        });

        let start = Instant::now();
        for stage in Stage::ALL {
            let payload = fallback(stage, &view);
            stage.validate(&payload).unwrap();
            assert!(payload.body.len() < 100_000);
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_categorize_by_keywords() {
        assert_eq!(categorize("New AI chip unveiled"), "Tech News");
        assert_eq!(categorize("Startup closes funding round"), "Business Updates");
        assert_eq!(categorize("Climate study forecast"), "Industry Analysis");
        assert_eq!(categorize("Scientific experiment on mice"), "Science & Research");
        assert_eq!(categorize("Local bakery wins prize"), "General");
        // "ai" must match as a word, not inside "said".
        assert_eq!(categorize("Mayor said hello"), "General");
    }

    #[test]
    fn test_basic_summary() {
        assert_eq!(basic_summary("One. Two. Three."), "One. Two.");
        assert_eq!(basic_summary(""), "No content available for summary.");
        let long = "a".repeat(300);
        assert_eq!(basic_summary(&long).chars().count(), 203);
    }

    #[test]
    fn test_formatting_defaults_subject_line() {
        let view = json!({"stages": {"drafting": {"body": "b", "metadata": {"title": "Tech Weekly"}}}});
        let payload = fallback(Stage::Formatting, &view);
        assert_eq!(payload.strings("subject_lines"), vec!["Your Tech Weekly"]);
    }

    #[test]
    fn test_topics_follow_profile_ranking() {
        let view = json!({"profile": {"weights": {"music": 0.2, "rust": 0.8}}});
        assert_eq!(topics_from_view(&view), vec!["rust", "music"]);
        let view = json!({"request": {"topics": ["space"]}, "profile": {"weights": {"rust": 1.0}}});
        assert_eq!(topics_from_view(&view), vec!["space"]);
    }
}
