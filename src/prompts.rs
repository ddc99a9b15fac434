//! Prompts for image description calls.
//!
//! Every prompt lives here so the wording can change without touching the
//! describer's timeout or error classification, and so tests can inspect the
//! exact text sent to the model.

/// System prompt for describing one image extracted from a document.
pub const DESCRIBE_SYSTEM_PROMPT: &str = r#"You describe images extracted from documents so that readers of a Markdown version of the document understand them without seeing the image.

Follow these rules precisely:

1. CONTENT
   - Describe what the image shows: charts, diagrams, photos, tables, formulas, screenshots
   - For charts, state the chart type, axes, series and the main trend or values
   - For diagrams, name the components and how they connect
   - Transcribe any legible text in the image verbatim

2. GROUNDING
   - Use the surrounding document text only to disambiguate what the image depicts
   - Do NOT summarise the surrounding text itself

3. OUTPUT FORMAT
   - Plain prose, at most one short paragraph (Markdown lists allowed for data points)
   - Do NOT start with "This image shows" or similar preambles
   - Do NOT wrap the answer in code fences
   - Do NOT add commentary about image quality unless the image is unreadable"#;

/// Build the user message text that accompanies the image.
///
/// Empty context halves are omitted; with no context at all the model gets a
/// bare instruction.
pub fn describe_user_prompt(context_before: &str, context_after: &str) -> String {
    let before = context_before.trim();
    let after = context_after.trim();
    if before.is_empty() && after.is_empty() {
        return "Describe this image.".to_string();
    }

    let mut prompt = String::from("Describe this image. Surrounding document text:\n");
    if !before.is_empty() {
        prompt.push_str(&format!("\nBefore the image:\n\"\"\"{before}\"\"\"\n"));
    }
    if !after.is_empty() {
        prompt.push_str(&format!("\nAfter the image:\n\"\"\"{after}\"\"\"\n"));
    }
    prompt
}
