//! Marked sections installed into shell and tmux configuration files.

use std::io;
use std::ops::Range;
use std::path::Path;

use crate::error::{Error, Result};

pub const SECTION_BEGIN: &str = "### SOCKLINK INSTALLATION BEGIN";
pub const SECTION_END: &str = "### SOCKLINK INSTALLATION END";

/// Hook array index used for our tmux hooks, clear of low indices users pick
const HOOK_INDEX: u32 = 4207;

/// Byte range of the installed section, markers included
fn find_section(text: &str) -> Option<Range<usize>> {
    let mut offset = 0;
    let mut begin = None;
    for line in text.split_inclusive('\n') {
        let marker = line.trim_end();
        match begin {
            None if marker == SECTION_BEGIN => begin = Some(offset),
            Some(start) if marker == SECTION_END => return Some(start..offset + line.len()),
            _ => {}
        }
        offset += line.len();
    }
    None
}

fn render_section(body: &str) -> String {
    let capacity = SECTION_BEGIN.len() + body.len() + SECTION_END.len() + 3;
    let mut section = String::with_capacity(capacity);
    section.push_str(SECTION_BEGIN);
    section.push('\n');
    section.push_str(body);
    if !body.is_empty() && !body.ends_with('\n') {
        section.push('\n');
    }
    section.push_str(SECTION_END);
    section.push('\n');
    section
}

/// Install `body` between the section markers of `text`.
///
/// An existing section has its body replaced and everything around it kept.
/// Otherwise the section is appended after one blank line.
pub fn set_section(text: &str, body: &str) -> String {
    let section = render_section(body);
    if let Some(range) = find_section(text) {
        let mut out = String::with_capacity(text.len() + section.len());
        out.push_str(&text[..range.start]);
        out.push_str(&section);
        out.push_str(&text[range.end..]);
        return out;
    }

    let head = text.trim_end_matches('\n');
    if head.is_empty() {
        return section;
    }
    format!("{head}\n\n{section}")
}

/// Whether socklink is mentioned outside the installed section
pub fn has_manual_config(text: &str) -> bool {
    match find_section(text) {
        Some(range) => {
            text[..range.start].contains("socklink") || text[range.end..].contains("socklink")
        }
        None => text.contains("socklink"),
    }
}

/// Check `exe` can be embedded in the generated hooks without escaping
fn quotable(exe: &Path) -> Result<&str> {
    exe.to_str()
        .filter(|s| !s.contains(['\'', '"', '$', '\\', '`', '\n']))
        .ok_or_else(|| Error::UnquotablePath {
            path: exe.to_path_buf(),
        })
}

/// Section for `.bashrc` / `.zshrc`
pub fn shell_hook(exe: &Path) -> Result<String> {
    let exe = quotable(exe)?;
    Ok(format!(
        r#"if [ -z "$TMUX" ]; then
    "{exe}" set-tty-link
else
    _socklink_sock="$("{exe}" show-server-link)"
    if [ -n "$_socklink_sock" ]; then
        export SSH_AUTH_SOCK="$_socklink_sock"
    fi
    unset _socklink_sock
fi
"#
    ))
}

/// Section for `.tmux.conf`
pub fn tmux_hook(exe: &Path, client_active: bool) -> Result<String> {
    let exe = quotable(exe)?;
    let mut hooks = vec!["client-attached", "session-created"];
    if client_active {
        hooks.push("client-active");
    }

    let mut conf = String::new();
    for hook in hooks {
        conf.push_str(&format!(
            r##"set-hook -g {hook}[{HOOK_INDEX}] 'run-shell -b "\"{exe}\" set-server-link --server #{{pid}} #{{client_tty}}"'"##
        ));
        conf.push('\n');
    }
    conf.push_str(&format!(
        r##"run-shell -b 'sock="$("{exe}" show-server-link --server #{{pid}})" && [ -n "$sock" ] && tmux -S "#{{socket_path}}" set-environment -g SSH_AUTH_SOCK "$sock"'"##
    ));
    conf.push('\n');
    Ok(conf)
}

/// What installing a section into one file did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionUpdate {
    pub changed: bool,
    /// The file mentions socklink outside the section as well
    pub manual_config: bool,
}

/// Install `body` into the file at `path`, creating it if needed.
///
/// With `dry_run` the file is only read.
pub async fn install_section(path: &Path, body: &str, dry_run: bool) -> Result<SectionUpdate> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(Error::io("failed to read", path, e)),
    };

    let updated = set_section(&text, body);
    let update = SectionUpdate {
        changed: updated != text,
        manual_config: has_manual_config(&text),
    };
    if update.manual_config {
        log::warn!("{} already mentions socklink outside the installed section", path.display());
    }
    if update.changed && !dry_run {
        tokio::fs::write(path, updated)
            .await
            .map_err(|e| Error::io("failed to write", path, e))?;
        log::info!("Installed socklink section into {}", path.display());
    }
    Ok(update)
}
