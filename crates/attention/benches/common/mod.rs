use std::{env, fs, path::PathBuf};

pub fn format_markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format!("| {} |", headers.join(" | ")));
    lines.push(format!("|{}|", vec!["---"; headers.len()].join("|")));
    lines.extend(rows.iter().map(|row| format!("| {} |", row.join(" | "))));
    lines.join("\n") + "\n"
}

/// Replaces (or appends) the `section` block of the attention results file.
///
/// The file lives under `GEMS_BENCH_DIR`, defaulting to `target/gems-bench`.
pub fn update_results(section: &str, content: &str) -> std::io::Result<()> {
    let dir = env::var_os("GEMS_BENCH_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("target").join("gems-bench"));
    fs::create_dir_all(&dir)?;
    let path = dir.join("attention.md");

    let tag = section.to_lowercase().replace(' ', "-");
    let begin = format!("<!-- begin:{tag} -->");
    let end = format!("<!-- end:{tag} -->");
    let block = format!("{begin}\n## {section}\n\n{content}{end}\n");

    let mut body = fs::read_to_string(&path).unwrap_or_else(|_| "# Attention kernels\n\n".to_string());
    match (body.find(&begin), body.find(&end)) {
        (Some(start), Some(stop)) if stop > start => {
            let stop = (stop + end.len() + 1).min(body.len());
            body.replace_range(start..stop, &block);
        }
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&block);
        }
    }
    fs::write(&path, body)
}
