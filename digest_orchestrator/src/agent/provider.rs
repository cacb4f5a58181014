//! Capability providers: the seam behind which search, generation and
//! visualization vendors live.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::ProviderError;
use crate::fallback::{
    articles_from_view, basic_summary, categorize, mindmap_markdown, sections_from_articles,
    title_case, topics_from_view, truncate_chars, DEFAULT_TOPICS,
};

/// External capability invoked by an agent.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Execute `task` with the agent's context view. The reply must be an
    /// object with a string `body` and an optional `metadata` map.
    async fn call(&self, task: &str, input: &Value) -> Result<Value, ProviderError>;
}

const TOPIC_KEYWORDS: [(&str, &[&str]); 8] = [
    ("technology", &["tech", "technology", "software", "hardware", "digital"]),
    ("artificial intelligence", &["ai", "artificial intelligence", "machine learning", "ml", "neural", "deep learning"]),
    ("business", &["business", "company", "corporate", "enterprise", "market"]),
    ("startups", &["startup", "startups", "entrepreneur", "venture", "funding"]),
    ("science", &["science", "research", "study", "discovery", "breakthrough"]),
    ("finance", &["finance", "financial", "money", "investment", "crypto", "blockchain"]),
    ("health", &["health", "medical", "healthcare", "medicine", "wellness"]),
    ("cybersecurity", &["security", "cyber", "hacking", "privacy", "data protection"]),
];

const TONES: [(&str, &[&str]); 3] = [
    ("casual", &["casual", "friendly", "conversational", "relaxed", "informal"]),
    ("professional", &["professional", "formal", "corporate"]),
    ("technical", &["technical", "detailed", "in-depth", "analytical", "expert"]),
];

const TIME_FRAMES: [(&str, &[&str], u32); 4] = [
    ("today", &["today", "today's"], 1),
    ("this_week", &["this week", "weekly", "week"], 7),
    ("recent", &["recent", "latest", "new", "current"], 3),
    ("trending", &["trending", "popular", "viral", "hot"], 3),
];

const ARTICLE_TEMPLATES: [&str; 4] = [
    "{} weekly briefing",
    "New research in {}",
    "{} market outlook",
    "What changed in {} this week",
];

/// What the prompt interpreter extracts from free text.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptAnalysis {
    pub topics: Vec<String>,
    pub tone: String,
    pub time_frame: String,
    pub days_back: u32,
}

/// Deterministic offline provider covering every agent vocabulary.
#[derive(Debug, Clone)]
pub struct TemplateProvider {
    days_pattern: Option<Regex>,
}

impl Default for TemplateProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateProvider {
    pub fn new() -> Self {
        Self {
            days_pattern: Regex::new(r"(?i)\b(?:last|past)?\s*(\d{1,3})\s+days?\b").ok(),
        }
    }

    pub fn analyze_prompt(&self, prompt: &str) -> PromptAnalysis {
        let lower = prompt.to_lowercase();
        let words: Vec<&str> = lower.split(|c: char| !c.is_alphanumeric() && c != '\'').collect();
        let mentions = |keyword: &&str| {
            if keyword.contains(' ') || keyword.contains('-') {
                lower.contains(*keyword)
            } else {
                words.contains(keyword)
            }
        };

        let topics: Vec<String> = TOPIC_KEYWORDS
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(mentions))
            .map(|(topic, _)| topic.to_string())
            .collect();

        let tone = TONES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(mentions))
            .map(|(tone, _)| tone.to_string())
            .unwrap_or_else(|| "professional".to_string());

        let (time_frame, mut days_back) = TIME_FRAMES
            .iter()
            .find(|(_, keywords, _)| keywords.iter().any(mentions))
            .map(|(frame, _, days)| (frame.to_string(), *days))
            .unwrap_or_else(|| ("recent".to_string(), 3));

        if let Some(days) = self
            .days_pattern
            .as_ref()
            .and_then(|re| re.captures(&lower))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
        {
            days_back = days.clamp(1, 30);
        }

        PromptAnalysis {
            topics,
            tone,
            time_frame,
            days_back,
        }
    }

    fn prompt_from(input: &Value) -> Result<String, ProviderError> {
        input["request"]["custom_prompt"]
            .as_str()
            .map(str::to_string)
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ProviderError::Rejected("custom prompt is required".to_string()))
    }

    fn articles_for(topic: &str, count: usize, days_back: u32, angle: Option<&str>) -> Vec<Value> {
        let slug = topic.to_lowercase().replace(' ', "-");
        (0..count)
            .map(|i| {
                let base = ARTICLE_TEMPLATES[i % ARTICLE_TEMPLATES.len()].replace("{}", &title_case(topic));
                let title = match angle {
                    Some(angle) => format!("{}: {}", base, truncate_chars(angle, 60)),
                    None => base,
                };
                json!({
                    "title": title,
                    "url": format!("https://news.example.com/{}/{}", slug, i + 1),
                    "summary": format!(
                        "A look at the most important {} stories of the past {} days. \
                         Analysts point to steady momentum and several notable announcements. \
                         More detail follows in the full piece.",
                        topic, days_back
                    ),
                    "topic": topic,
                    "category": categorize(&title),
                    "published_days_ago": (i as u32) % days_back.max(1),
                    "source": "template",
                })
            })
            .collect()
    }

    fn search_by_preferences(&self, input: &Value) -> Result<Value, ProviderError> {
        let topic = input["branch"]["topic"]
            .as_str()
            .map(str::to_string)
            .or_else(|| topics_from_view(input).into_iter().next())
            .ok_or_else(|| ProviderError::Rejected("no topics provided for search".to_string()))?;
        let days_back = input["request"]["days_back"].as_u64().unwrap_or(3) as u32;
        let per_topic = input["request"]["max_articles"].as_u64().unwrap_or(3).clamp(1, 3) as usize;

        let articles = Self::articles_for(&topic, per_topic, days_back, None);
        Ok(json!({
            "body": format!("Found {} articles about {}", articles.len(), topic),
            "metadata": { "articles": articles, "topics": [topic], "search_type": "topics" },
        }))
    }

    fn search_custom_prompt(&self, input: &Value) -> Result<Value, ProviderError> {
        let prompt = Self::prompt_from(input)?;
        let interpreted = &input["steps"]["process_prompt"]["metadata"];
        let mut topics: Vec<String> = interpreted["topics"]
            .as_array()
            .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if topics.is_empty() {
            topics = topics_from_view(input);
        }
        let days_back = interpreted["days_back"]
            .as_u64()
            .or_else(|| input["request"]["days_back"].as_u64())
            .unwrap_or(3) as u32;

        let articles: Vec<Value> = topics
            .iter()
            .take(3)
            .flat_map(|topic| Self::articles_for(topic, 2, days_back, Some(&prompt)))
            .collect();
        Ok(json!({
            "body": format!("Found {} articles for the custom prompt", articles.len()),
            "metadata": {
                "articles": articles,
                "topics": topics,
                "search_type": "custom_prompt",
                "search_query": interpreted["search_query"].as_str().unwrap_or(&prompt),
            },
        }))
    }

    fn get_trending_content(&self, input: &Value) -> Result<Value, ProviderError> {
        let days_back = input["request"]["days_back"].as_u64().unwrap_or(3) as u32;
        let articles: Vec<Value> = DEFAULT_TOPICS
            .iter()
            .flat_map(|topic| Self::articles_for(topic, 2, days_back, Some("trending")))
            .collect();
        Ok(json!({
            "body": format!("{} trending articles", articles.len()),
            "metadata": { "articles": articles, "search_type": "trending" },
        }))
    }

    fn process_prompt(&self, input: &Value, enhance_only: bool) -> Result<Value, ProviderError> {
        let prompt = Self::prompt_from(input)?;
        let analysis = self.analyze_prompt(&prompt);
        let search_query = if analysis.topics.is_empty() {
            prompt.clone()
        } else {
            format!("{} ({})", prompt, analysis.topics.join(", "))
        };
        let body = if enhance_only {
            format!("{}, focusing on developments from the last {} days", search_query, analysis.days_back)
        } else {
            format!(
                "Prompt targets {} with a {} tone",
                if analysis.topics.is_empty() {
                    "general news".to_string()
                } else {
                    analysis.topics.join(", ")
                },
                analysis.tone
            )
        };
        Ok(json!({
            "body": body,
            "metadata": {
                "original_prompt": prompt,
                "topics": analysis.topics,
                "tone": analysis.tone,
                "time_frame": analysis.time_frame,
                "days_back": analysis.days_back,
                "search_query": search_query,
            },
        }))
    }

    fn get_preferences(&self, input: &Value) -> Result<Value, ProviderError> {
        let topics = topics_from_view(input);
        let related = input["steps"]["recall_memory"]["metadata"]["related"].clone();
        let related = if related.is_array() { related } else { json!([]) };
        Ok(json!({
            "body": format!("User prefers {}", topics.join(", ")),
            "metadata": {
                "topics": topics,
                "weights": input["profile"]["weights"].clone(),
                "related": related,
                "tone": "professional",
            },
        }))
    }

    fn analyze_preferences(&self, input: &Value) -> Result<Value, ProviderError> {
        let from_stage: Vec<String> = input["stages"]["retrieving_preferences"]["metadata"]["topics"]
            .as_array()
            .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let topics = if from_stage.is_empty() {
            topics_from_view(input)
        } else {
            from_stage
        };
        let dominant = topics.first().cloned().unwrap_or_else(|| DEFAULT_TOPICS[0].to_string());
        Ok(json!({
            "body": format!("Focus on {}", dominant),
            "metadata": { "topics": topics, "dominant_topic": dominant, "tone": "professional" },
        }))
    }

    fn recommend_preferences(&self, input: &Value) -> Result<Value, ProviderError> {
        let known: Vec<String> = topics_from_view(input);
        let mut suggestions: Vec<String> = Vec::new();
        for article in articles_from_view(input) {
            if let Some(topic) = article["topic"].as_str() {
                if !known.iter().any(|k| k == topic) && !suggestions.iter().any(|s| s == topic) {
                    suggestions.push(topic.to_string());
                }
            }
        }
        Ok(json!({
            "body": format!("{} new topics to consider", suggestions.len()),
            "metadata": { "suggested_topics": suggestions },
        }))
    }

    fn digest_title(input: &Value, dominant: Option<&str>) -> String {
        if let Some(prompt) = input["request"]["custom_prompt"].as_str().filter(|p| !p.trim().is_empty()) {
            let prompt = truncate_chars(prompt.trim(), 50);
            let lower = prompt.to_lowercase();
            return if lower.contains("weekly") {
                format!("Weekly Update: {}", prompt)
            } else if lower.contains("daily") {
                format!("Daily Brief: {}", prompt)
            } else {
                format!("Custom Digest: {}", prompt)
            };
        }
        match dominant {
            Some(topic) => format!("Your {} Digest", title_case(topic)),
            None => "Your Personalized Digest".to_string(),
        }
    }

    fn structure_content(&self, input: &Value) -> Result<Value, ProviderError> {
        let articles = articles_from_view(input);
        if articles.is_empty() {
            return Err(ProviderError::Rejected("no articles to structure".to_string()));
        }
        let dominant = input["steps"]["analyze_preferences"]["metadata"]["dominant_topic"].as_str();
        let title = Self::digest_title(input, dominant);
        let sections = sections_from_articles(&articles);
        Ok(json!({
            "body": format!("{} sections planned", sections.len()),
            "metadata": { "title": title, "sections": sections, "article_count": articles.len() },
        }))
    }

    fn generate_sections(&self, input: &Value) -> Result<Value, ProviderError> {
        let structure = &input["steps"]["structure_content"]["metadata"];
        let sections: Vec<Value> = structure["sections"]
            .as_array()
            .ok_or_else(|| ProviderError::Malformed("structure has no sections".to_string()))?
            .iter()
            .map(|section| {
                let summaries: Vec<&str> = section["articles"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|x| x["summary"].as_str()).collect())
                    .unwrap_or_default();
                let mut section = section.clone();
                if let Some(fields) = section.as_object_mut() {
                    fields.insert("content".to_string(), json!(basic_summary(&summaries.join(" "))));
                }
                section
            })
            .collect();
        Ok(json!({
            "body": format!("Wrote {} sections", sections.len()),
            "metadata": { "title": structure["title"].clone(), "sections": sections },
        }))
    }

    fn enhance_with_memory(&self, input: &Value) -> Result<Value, ProviderError> {
        let drafted = &input["steps"]["generate_sections"]["metadata"];
        let related_count = input["stages"]["retrieving_preferences"]["metadata"]["related"]
            .as_array()
            .map(Vec::len)
            .unwrap_or(0);
        let note = if related_count == 0 {
            "First digest on these topics".to_string()
        } else {
            format!("Builds on {} earlier items you engaged with", related_count)
        };
        Ok(json!({
            "body": note,
            "metadata": {
                "title": drafted["title"].clone(),
                "sections": drafted["sections"].clone(),
                "related_count": related_count,
                "personalization": note,
            },
        }))
    }

    fn format_output(&self, input: &Value) -> Result<Value, ProviderError> {
        let enhanced = &input["steps"]["enhance_with_memory"]["metadata"];
        let title = enhanced["title"].as_str().unwrap_or("Your Personalized Digest").to_string();
        let sections = enhanced["sections"].as_array().cloned().unwrap_or_default();
        let topics: Vec<Value> = input["steps"]["analyze_preferences"]["metadata"]["topics"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut lines = vec![format!("# {}", title)];
        if let Some(note) = enhanced["personalization"].as_str() {
            lines.push(format!("_{}_", note));
        }
        for section in &sections {
            lines.push(String::new());
            lines.push(format!("## {}", section["title"].as_str().unwrap_or("Section")));
            if let Some(content) = section["content"].as_str() {
                lines.push(content.to_string());
            }
            for article in section["articles"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
                lines.push(format!(
                    "- [{}]({})",
                    article["title"].as_str().unwrap_or_default(),
                    article["url"].as_str().unwrap_or_default()
                ));
            }
        }
        let body = lines.join("\n");
        let summary = sections
            .first()
            .and_then(|s| s["content"].as_str())
            .unwrap_or_default()
            .to_string();
        let word_count = body.split_whitespace().count();

        Ok(json!({
            "body": body,
            "metadata": {
                "title": title,
                "sections": sections,
                "topics": topics,
                "summary": summary,
                "word_count": word_count,
            },
        }))
    }

    fn generate_subject_lines(&self, input: &Value) -> Result<Value, ProviderError> {
        let drafting = &input["stages"]["drafting"]["metadata"];
        let title = drafting["title"].as_str().unwrap_or("Personalized Digest");
        let main_theme = drafting["topics"]
            .as_array()
            .and_then(|t| t.first())
            .and_then(Value::as_str);

        let mut lines = Vec::new();
        if let Some(theme) = main_theme {
            lines.push(format!("This Week in {}", title_case(theme)));
            lines.push(format!("Latest {} Updates You Need to Know", title_case(theme)));
        }
        if title.starts_with("Your ") {
            lines.push(title.to_string());
        } else {
            lines.push(format!("Your {}", title));
        }
        lines.push("Key Insights to Keep You Ahead".to_string());
        lines.push("The Stories That Matter Right Now".to_string());
        lines.truncate(5);

        Ok(json!({
            "body": lines[0].clone(),
            "metadata": { "subject_lines": lines },
        }))
    }

    fn format_for_delivery(&self, input: &Value) -> Result<Value, ProviderError> {
        let subject_lines = input["steps"]["generate_subject_lines"]["metadata"]["subject_lines"].clone();
        if subject_lines.as_array().map(Vec::is_empty).unwrap_or(true) {
            return Err(ProviderError::Malformed("no subject lines to deliver".to_string()));
        }
        let body = input["stages"]["drafting"]["body"].as_str().unwrap_or_default();
        let word_count = body.split_whitespace().count();
        let mut text = body.to_string();
        if let Some(mindmap) = input["stages"]["enhancing"]["metadata"]["mindmap"].as_str() {
            text.push_str("\n\n---\n\n");
            text.push_str(mindmap);
        }
        Ok(json!({
            "body": text,
            "metadata": {
                "subject_lines": subject_lines,
                "format": "text",
                "read_time_minutes": (word_count / 200).max(1),
            },
        }))
    }

    fn generate_mindmap(&self, input: &Value, topics_only: bool) -> Result<Value, ProviderError> {
        let drafting = &input["stages"]["drafting"]["metadata"];
        let title = drafting["title"].as_str().unwrap_or("Digest Mindmap");
        let topics: Vec<String> = drafting["topics"]
            .as_array()
            .map(|t| t.iter().filter_map(Value::as_str).map(str::to_string).collect::<Vec<_>>())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| topics_from_view(input));
        let sections: Vec<Value> = if topics_only {
            Vec::new()
        } else {
            drafting["sections"].as_array().cloned().unwrap_or_default()
        };
        let article_count = sections
            .iter()
            .map(|s| s["articles"].as_array().map(Vec::len).unwrap_or(0))
            .sum();
        let mindmap = mindmap_markdown(title, &topics, &sections, article_count, drafting["summary"].as_str());
        Ok(json!({
            "body": format!("Mindmap with {} topics", topics.len()),
            "metadata": { "mindmap": mindmap, "format": "markdown" },
        }))
    }
}

#[async_trait]
impl CapabilityProvider for TemplateProvider {
    fn name(&self) -> &str {
        "template"
    }

    async fn call(&self, task: &str, input: &Value) -> Result<Value, ProviderError> {
        match task {
            "search_by_preferences" => self.search_by_preferences(input),
            "search_custom_prompt" => self.search_custom_prompt(input),
            "get_trending_content" => self.get_trending_content(input),
            "process_prompt" | "analyze_prompt" => self.process_prompt(input, false),
            "enhance_prompt" => self.process_prompt(input, true),
            "get_preferences" => self.get_preferences(input),
            "analyze_preferences" => self.analyze_preferences(input),
            "recommend_preferences" => self.recommend_preferences(input),
            "structure_content" => self.structure_content(input),
            "generate_sections" => self.generate_sections(input),
            "enhance_with_memory" => self.enhance_with_memory(input),
            "format_output" => self.format_output(input),
            "generate_subject_lines" => self.generate_subject_lines(input),
            "format_for_delivery" => self.format_for_delivery(input),
            "generate_mindmap" => self.generate_mindmap(input, false),
            "create_topic_mindmap" => self.generate_mindmap(input, true),
            other => Err(ProviderError::Rejected(format!("unknown task '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_analysis() {
        let provider = TemplateProvider::new();
        let analysis = provider.analyze_prompt("Latest AI startup funding news, casual please");
        assert!(analysis.topics.contains(&"artificial intelligence".to_string()));
        assert!(analysis.topics.contains(&"startups".to_string()));
        assert_eq!(analysis.tone, "casual");
        assert_eq!(analysis.time_frame, "recent");
        assert_eq!(analysis.days_back, 3);

        let weekly = provider.analyze_prompt("What happened in biotech this week?");
        assert_eq!(weekly.time_frame, "this_week");
        assert_eq!(weekly.days_back, 7);

        let explicit = provider.analyze_prompt("security news from the past 10 days");
        assert_eq!(explicit.days_back, 10);
        assert_eq!(explicit.topics, vec!["cybersecurity"]);
    }

    #[tokio::test]
    async fn test_search_uses_branch_topic() {
        let provider = TemplateProvider::new();
        let input = json!({"branch": {"topic": "rust"}, "request": {"max_articles": 10, "days_back": 3}});
        let reply = provider.call("search_by_preferences", &input).await.unwrap();
        let articles = reply["metadata"]["articles"].as_array().unwrap();
        assert_eq!(articles.len(), 3);
        assert!(articles.iter().all(|a| a["topic"] == "rust"));
    }

    #[tokio::test]
    async fn test_custom_prompt_requires_prompt() {
        let provider = TemplateProvider::new();
        let err = provider
            .call("process_prompt", &json!({"request": {"custom_prompt": null}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_subject_lines_include_default() {
        let provider = TemplateProvider::new();
        let input = json!({"stages": {"drafting": {"metadata": {"title": "Your Rust Digest", "topics": ["rust"]}}}});
        let reply = provider.call("generate_subject_lines", &input).await.unwrap();
        let lines = reply["metadata"]["subject_lines"].as_array().unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "This Week in Rust");
        assert!(lines.iter().any(|l| l == "Your Rust Digest"));
    }
}
