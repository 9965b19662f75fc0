/// Reply-format instruction shared by every backend.
pub const JSON_INSTRUCTION: &str = r#"Return ONLY a single-line JSON object with keys:
"answer": string (may be "A".."Z", number like "2", boolean "True"/"False", or free text),
"reason": string (optional, brief).
No Markdown, no code fences, no extra text. Please use Indonesian if the question is in Indonesian."#;

/// Build the prompt for recognized quiz text, optionally constrained to a list of choices.
pub fn build_prompt_with_choices(ocr_text: &str, choices: &[String]) -> String {
    let mut prompt = String::with_capacity(JSON_INSTRUCTION.len() + ocr_text.len() + 128);
    prompt.push_str(JSON_INSTRUCTION);
    prompt.push_str("\n\nSolve this quiz based on the OCR text below.\n");

    if !choices.is_empty() {
        prompt.push_str("If appropriate, select ONLY ONE from these options:\n");
        for choice in choices {
            prompt.push_str("- ");
            prompt.push_str(choice);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nOCR:\n");
    prompt.push_str(ocr_text);
    prompt.push('\n');
    prompt
}

pub fn build_prompt(ocr_text: &str) -> String {
    build_prompt_with_choices(ocr_text, &[])
}
