/// A model name with its optional thinking-level suffix split off.
///
/// `gpt-5(high)` requests the `gpt-5` model with the `high` thinking level.
/// The suffix shapes the upstream request; selector cursors and model-state
/// keys always use the base name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedModel<'a> {
    pub base: &'a str,
    pub level: Option<&'a str>,
}

pub fn parse_suffix(model: &str) -> ParsedModel<'_> {
    let trimmed = model.trim();
    if let Some(stripped) = trimmed.strip_suffix(')')
        && let Some(open) = stripped.rfind('(')
    {
        let base = &stripped[..open];
        let level = &stripped[open + 1..];
        if !base.is_empty() && !level.is_empty() {
            return ParsedModel {
                base,
                level: Some(level),
            };
        }
    }
    ParsedModel {
        base: trimmed,
        level: None,
    }
}

/// Base model name with any thinking suffix stripped.
pub fn base_model(model: &str) -> &str {
    parse_suffix(model).base
}
