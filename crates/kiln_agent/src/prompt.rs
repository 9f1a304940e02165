//! System prompt construction.

use serde::{Deserialize, Serialize};

/// What the system prompt needs to know about a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptContext {
    pub template_id: String,
    pub name: String,
    pub instructions: String,
    /// Primary file the generated code goes into
    pub file: Option<String>,
    /// Libraries already installed in the template
    pub lib: Vec<String>,
    /// Port the dev server listens on
    pub port: Option<u16>,
}

/// Render the system prompt for a template.
pub fn system_prompt(ctx: &PromptContext) -> String {
    let mut prompt = String::from(
        "You are a skilled software engineer working inside an isolated sandbox.\n\
         You build what the user asks for by writing files and running commands with your tools.\n\
         Do not stop until the project is complete.\n",
    );

    prompt.push_str(&format!(
        "\nTemplate: {} ({})\n{}\n",
        ctx.template_id, ctx.name, ctx.instructions
    ));

    if let Some(file) = &ctx.file {
        prompt.push_str(&format!("Main file: {}\n", file));
    }

    if ctx.lib.is_empty() {
        prompt.push_str("Preinstalled libraries: none\n");
    } else {
        prompt.push_str(&format!("Preinstalled libraries: {}\n", ctx.lib.join(", ")));
    }

    match ctx.port {
        Some(port) => prompt.push_str(&format!(
            "The dev server is started for you on port {}. Never start it yourself.\n",
            port
        )),
        None => prompt.push_str(
            "There is no server. Run the code with the executeCode tool and report the result.\n",
        ),
    }

    prompt.push_str(
        "\nRules:\n\
         - Use createOrUpdateFiles to write complete files, never partial snippets.\n\
         - Install extra dependencies with the terminal tool; do not edit dependency manifests by hand.\n\
         - Read a file before changing it if you did not write it.\n\
         - When asked to fix an error, change only what the error requires.\n",
    );

    prompt
}
