//! The opening messages of a documentation run.

use walkdir::WalkDir;

use crate::llm::{ChatMessage, FINAL_ANSWER_TOOL};
use crate::tools::{Snapshot, ToolLimits};

/// Deepest directory level shown in the folder tree.
pub const TREE_DEPTH: usize = 3;

/// Most tree lines shown before the listing is cut.
pub const TREE_MAX_LINES: usize = 300;

const README_NAMES: [&str; 4] = ["README.md", "README.rst", "README.txt", "README"];

/// System prompt describing the task and how to finish it.
pub fn system_prompt() -> String {
    format!(
        "You are an experienced software engineer writing documentation for a codebase \
         you have just been handed. Your reader is a newcomer to the project who needs to \
         learn how to use it and how it is put together.\n\
         \n\
         Explore the repository with the tools you are given: list_files to see what \
         exists, read_file to read source, search_code to find where something is defined \
         or used. Record your findings with write_section, one section per topic. Cover:\n\
         - an overview of what the project does;\n\
         - the important functions and types: where they live, what they import, their \
         signatures and what they do;\n\
         - how the files depend on and call each other;\n\
         - a closing summary.\n\
         \n\
         Write in Markdown. Only describe what you have read in the code. If you cannot \
         tell what something does, say it is unidentified instead of guessing.\n\
         \n\
         Call exactly one tool per reply. When the documentation is complete, call \
         {FINAL_ANSWER_TOOL}; any sections passed to it are added after the ones already \
         written."
    )
}

/// First user message: the README and the folder tree of the snapshot.
pub fn initial_user_message(snapshot: &Snapshot, limits: &ToolLimits) -> String {
    let mut message = String::new();
    match read_readme(snapshot) {
        Some(readme) => {
            message.push_str("<read>\nREADME file:\n");
            message.push_str(&readme);
            message.push_str("\n</read>\n\n");
        }
        None => message.push_str("The repository has no README file.\n\n"),
    }
    message.push_str("Codebase folder structure:\n");
    message.push_str(&folder_tree(snapshot, limits));
    message
}

/// Both opening messages, in order.
pub fn opening_messages(snapshot: &Snapshot, limits: &ToolLimits) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(system_prompt()),
        ChatMessage::user(initial_user_message(snapshot, limits)),
    ]
}

fn read_readme(snapshot: &Snapshot) -> Option<String> {
    let root = snapshot.root();
    let path = README_NAMES
        .iter()
        .map(|name| root.join(name))
        .find(|p| p.is_file())?;
    let bytes = std::fs::read(path).ok()?;
    let text = clean_readme(&String::from_utf8_lossy(&bytes));
    (!text.is_empty()).then_some(text)
}

/// Strip HTML comments and blank lines.
pub fn clean_readme(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        stripped.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => {
                rest = "";
                break;
            }
        }
    }
    stripped.push_str(rest);

    stripped
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Indented listing of the snapshot, directories marked with a trailing `/`.
pub fn folder_tree(snapshot: &Snapshot, limits: &ToolLimits) -> String {
    let root = snapshot.root();
    let root_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());

    let mut lines = vec![format!("{root_name}/")];
    let mut hidden = 0usize;
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(TREE_DEPTH)
        .follow_links(false)
        .sort_by(|a, b| {
            // Files first, then directories, each by name.
            (a.file_type().is_dir(), a.file_name()).cmp(&(b.file_type().is_dir(), b.file_name()))
        })
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && limits
                    .exclude_dirs
                    .iter()
                    .any(|d| e.file_name().to_string_lossy() == d.as_str()))
        });

    for entry in walker.filter_map(Result::ok) {
        if lines.len() > TREE_MAX_LINES {
            hidden += 1;
            continue;
        }
        let indent = "  ".repeat(entry.depth());
        let name = entry.file_name().to_string_lossy();
        let suffix = if entry.file_type().is_dir() { "/" } else { "" };
        lines.push(format!("{indent}{name}{suffix}"));
    }
    if hidden > 0 {
        lines.push(format!("... {hidden} more entries not shown"));
    }
    lines.join("\n")
}
