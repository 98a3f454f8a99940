//! Corrective follow-up prompts

use crate::classifier::BuildError;

const CORRECTION_HEADER: &str =
    "The previous attempt produced the following errors while building or running. \
     Fix them and return the complete corrected project:";

/// Append the collected build errors to the original instructions.
///
/// Returns `None` when there is nothing to correct.
pub fn corrective_prompt(instructions: &str, errors: &[BuildError]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }

    let mut prompt = instructions.trim_end().to_string();
    prompt.push_str("\n\n");
    prompt.push_str(CORRECTION_HEADER);
    prompt.push('\n');
    for error in errors {
        prompt.push('\n');
        prompt.push_str(error.message.trim_end());
    }
    Some(prompt)
}
