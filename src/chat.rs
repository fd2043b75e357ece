use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// An ordered conversation used to assemble few-shot prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Chat {
    pub messages: Vec<(Role, String)>,
}

impl Chat {
    pub fn new(instruction: &str) -> Self {
        let mut chat = Self::default();
        if !instruction.is_empty() {
            chat.add(Role::System, instruction);
        }
        chat
    }

    pub fn add(&mut self, role: Role, content: &str) {
        self.messages.push((role, content.to_string()));
    }

    /// Renders the conversation through a model template by folding message
    /// pairs: the even-indexed message fills the template's system slot, the
    /// odd-indexed one its prompt slot. A trailing unpaired message renders
    /// with an empty prompt slot.
    pub fn render(&self, template: &PromptTemplate) -> String {
        let mut rendered = String::new();
        for pair in self.messages.chunks(2) {
            let system = &pair[0].1;
            let prompt = pair.get(1).map(|(_, content)| content.as_str()).unwrap_or("");
            rendered.push_str(&template.render(system, prompt));
        }
        rendered
    }
}

/// A model prompt template in portable form: `{{ system }}` / `{{ prompt }}`
/// substitution slots plus an optional `{% if system %}...{% endif %}` guard.
/// Backend-native template syntax is normalized into this form on parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn parse(backend_template: &str) -> Self {
        let mut template = backend_template
            .replace(".Prompt", "prompt")
            .replace(".System", "system");

        // The backend reports templates in its own conditional syntax; fold
        // the guard forms into the portable one.
        let open = Regex::new(r"\{\{-?\s*if\s+system\s*\}\}").unwrap();
        let close = Regex::new(r"\{\{-?\s*end\s*\}\}").unwrap();
        template = open.replace_all(&template, "{% if system %}").into_owned();
        template = close.replace_all(&template, "{% endif %}").into_owned();

        Self { template }
    }

    pub fn render(&self, system: &str, prompt: &str) -> String {
        let mut rendered = self.template.clone();

        if let (Some(start), Some(end)) =
            (rendered.find("{% if system %}"), rendered.find("{% endif %}"))
        {
            if end > start {
                let inner_start = start + "{% if system %}".len();
                let inner = rendered[inner_start..end].to_string();
                let replacement = if system.is_empty() { String::new() } else { inner };
                rendered.replace_range(start..end + "{% endif %}".len(), &replacement);
            }
        }

        rendered
            .replace("{{ system }}", system)
            .replace("{{system}}", system)
            .replace("{{ prompt }}", prompt)
            .replace("{{prompt}}", prompt)
    }
}
