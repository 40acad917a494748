use crate::dispatch::GenerationOutcome;

/// Characters Telegram MarkdownV2 reserves outside of entities.
const MARKDOWN_V2_RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Visual delimiter appended after every reply body.
const TURN_SEPARATOR: &str = "\n---";

/// Ordered literal-to-literal substitution table, applied in one pass.
///
/// At each position the first rule whose literal matches is applied and the
/// scan resumes after the matched literal, so replacement text is never
/// rescanned. Input is not inspected for existing escapes.
#[derive(Debug, Clone)]
pub struct Replacer {
    rules: Vec<(String, String)>,
}

impl Replacer {
    pub fn new<I, L, R>(rules: I) -> Self
    where
        I: IntoIterator<Item = (L, R)>,
        L: Into<String>,
        R: Into<String>,
    {
        let rules = rules
            .into_iter()
            .map(|(literal, replacement)| (literal.into(), replacement.into()))
            .filter(|(literal, _)| !literal.is_empty())
            .collect();
        Self { rules }
    }

    /// Backslash-escape every MarkdownV2 reserved character.
    pub fn markdown_v2() -> Self {
        Self::new(
            MARKDOWN_V2_RESERVED
                .iter()
                .map(|c| (c.to_string(), format!("\\{}", c))),
        )
    }

    pub fn replace(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len() + input.len() / 8);
        let mut rest = input;

        'scan: while !rest.is_empty() {
            for (literal, replacement) in &self.rules {
                if let Some(after) = rest.strip_prefix(literal.as_str()) {
                    out.push_str(replacement);
                    rest = after;
                    continue 'scan;
                }
            }
            // Rules matched nothing here; copy one char through.
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }

        out
    }
}

/// Turn a generation outcome into a reply body, or `None` when nothing should be sent.
///
/// Only the first candidate is used. Its fragments are joined without a
/// separator, escaped, and terminated with the turn separator.
pub fn format(replacer: &Replacer, outcome: &GenerationOutcome) -> Option<String> {
    let response = match outcome {
        GenerationOutcome::Generated(response) => response,
        GenerationOutcome::NoResponse => return None,
    };
    let candidate = response.candidates.first()?;

    let raw: String = candidate.fragments.concat();
    let mut body = replacer.replace(&raw);
    body.push_str(TURN_SEPARATOR);
    Some(body)
}
