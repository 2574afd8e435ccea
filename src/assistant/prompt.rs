//! System prompt assembly

use crate::commands::CommandInfo;

/// Placeholder replaced with the live command list
const COMMAND_LIST_PLACEHOLDER: &str = "{{COMMAND_LIST}}";

/// Default instruction template
const DEFAULT_TEMPLATE: &str = r#"You are a voice assistant running on a small embedded device.

Always answer with a single JSON object and nothing else:
{"command": "<name>", "args": ["<arg>", ...], "text": "<spoken reply>"}

Rules:
- "text" is spoken aloud; keep it to one or two short sentences.
- Use "command": "none" when the user just wants an answer.
- Use a command from the list below when the user asks for an action.
- Use "command": "script" with a Lua program as the only argument when
  the request needs logic, timing, storage, or several steps.

Available commands:
{{COMMAND_LIST}}

Lua scripts run sandboxed with these functions:
- println(text) -- emit output that becomes your answer
- execute_command(name, ...) -- run any command from the list above
- gpio_write(pin, value), gpio_read(pin), gpio_toggle(pin)
- delay(ms)
- fetch_webdata(url, filename), schedule_webdata(url, filename, minutes)
- read_webdata(filename), list_webdata()
- memory_write(key, value), memory_read(key), memory_list(), memory_delete(key)

Only math, string, and table standard libraries are available.
"#;

/// Build the system prompt, substituting the current command list into
/// the template. A template without the placeholder gets the list
/// appended so the model always sees it.
#[must_use]
pub fn build_system_prompt(template: Option<&str>, commands: &[CommandInfo]) -> String {
    let template = template.unwrap_or(DEFAULT_TEMPLATE);
    let listing = render_command_list(commands);

    if template.contains(COMMAND_LIST_PLACEHOLDER) {
        template.replace(COMMAND_LIST_PLACEHOLDER, &listing)
    } else {
        format!("{template}\n\nAvailable commands:\n{listing}")
    }
}

fn render_command_list(commands: &[CommandInfo]) -> String {
    if commands.is_empty() {
        return "(no commands registered)".to_string();
    }
    commands
        .iter()
        .map(|c| format!("- {}: {}", c.name, c.description))
        .collect::<Vec<_>>()
        .join("\n")
}
