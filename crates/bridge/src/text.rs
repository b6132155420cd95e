//! Indentation helpers for cell source.

/// Prefix every non-blank line of `text` with `pad`.
pub fn indent(text: &str, pad: &str) -> String {
    map_lines(text, |line| {
        if line.trim().is_empty() {
            line.to_string()
        } else {
            format!("{}{}", pad, line)
        }
    })
}

/// Remove the leading whitespace common to every non-blank line.
/// Whitespace-only lines become empty.
pub fn dedent(text: &str) -> String {
    let common = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| &line[..line.len() - line.trim_start().len()])
        .reduce(common_prefix)
        .unwrap_or("");

    map_lines(text, |line| {
        if line.trim().is_empty() {
            String::new()
        } else {
            line[common.len()..].to_string()
        }
    })
}

fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let len = a
        .char_indices()
        .zip(b.chars())
        .take_while(|((_, x), y)| x == y)
        .last()
        .map(|((i, c), _)| i + c.len_utf8())
        .unwrap_or(0);
    &a[..len]
}

/// Apply `f` to each line, keeping the original line endings.
fn map_lines(text: &str, f: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    for piece in text.split_inclusive('\n') {
        let (line, ending) = match piece.strip_suffix("\r\n") {
            Some(line) => (line, "\r\n"),
            None => match piece.strip_suffix('\n') {
                Some(line) => (line, "\n"),
                None => (piece, ""),
            },
        };
        out.push_str(&f(line));
        out.push_str(ending);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indent() {
        assert_eq!(indent("a\n  b\n", "    "), "    a\n      b\n");
        assert_eq!(indent("a\n\nb", "\t"), "\ta\n\n\tb");
    }

    #[test]
    fn test_dedent() {
        assert_eq!(dedent("    a\n      b\n"), "a\n  b\n");
        assert_eq!(dedent("  a\n \n  b"), "a\n\nb");
        assert_eq!(dedent("a\n  b"), "a\n  b");
        assert_eq!(dedent(""), "");
    }

    #[test]
    fn test_mixed_tabs_and_spaces_share_only_true_prefix() {
        assert_eq!(dedent("\t  a\n\t b"), " a\nb");
    }

    #[test]
    fn test_dedent_undoes_indent() {
        let samples = [
            "def f():\n    return 1\n",
            "x = 1\ny = 2",
            "@app.cell\ndef _():\n    import marimo as mo\n    return (mo,)\r\n",
            "if x:\n\n    pass\n",
        ];
        for text in samples {
            for pad in ["    ", "\t", "  "] {
                assert_eq!(dedent(&indent(text, pad)), text, "pad {:?}", pad);
            }
        }
    }
}
