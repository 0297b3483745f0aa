//! Pretty printing utilities for scheduled programs and graphs.
//!
//! `PrettyPrint` renders width-aware documents through the `pretty` crate;
//! `CodeFormatter` is a plain indenting writer for line-oriented output
//! such as traces and DOT files.

use pretty::RcDoc;

/// Default line width for pretty printing.
pub const DEFAULT_WIDTH: usize = 80;

/// A pretty-printable value.
pub trait PrettyPrint {
    /// Convert to a pretty document.
    fn to_doc(&self) -> RcDoc<'_, ()>;

    /// Pretty print to a string with the given width.
    fn pretty_print(&self, width: usize) -> String {
        let mut output = Vec::new();
        if self.to_doc().render(width, &mut output).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    /// Pretty print with default width.
    fn pretty(&self) -> String {
        self.pretty_print(DEFAULT_WIDTH)
    }
}

/// Line-oriented writer that indents nested suites and blocks.
#[derive(Debug)]
pub struct CodeFormatter {
    output: String,
    depth: usize,
    unit: String,
}

impl CodeFormatter {
    /// Formatter indenting by `unit` per nesting level.
    pub fn new(unit: &str) -> Self {
        Self { output: String::new(), depth: 0, unit: unit.to_string() }
    }

    /// Two-space indentation.
    pub fn default_indent() -> Self {
        Self::new("  ")
    }

    /// Append `text` at the current depth; embedded newlines start new
    /// indented lines.
    pub fn writeln(&mut self, text: &str) {
        for line in text.split('\n') {
            if !line.is_empty() {
                self.output.push_str(&self.unit.repeat(self.depth));
                self.output.push_str(line);
            }
            self.output.push('\n');
        }
    }

    fn nested<F: FnOnce(&mut Self)>(&mut self, body: F) {
        self.depth += 1;
        body(self);
        self.depth -= 1;
    }

    /// `header {`, the indented body, then `}`.
    pub fn block<F: FnOnce(&mut Self)>(&mut self, header: &str, body: F) {
        self.writeln(&format!("{} {{", header));
        self.nested(body);
        self.writeln("}");
    }

    /// A header line followed by an indented body, Python style.
    pub fn suite<F: FnOnce(&mut Self)>(&mut self, header: &str, body: F) {
        self.writeln(header);
        self.nested(body);
    }

    /// The accumulated text.
    pub fn finish(self) -> String {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block() {
        let mut fmt = CodeFormatter::default_indent();
        fmt.block("digraph g", |f| {
            f.writeln("a -> b;");
        });

        let output = fmt.finish();
        assert!(output.contains("digraph g {"));
        assert!(output.contains("  a -> b;"));
        assert!(output.ends_with("}\n"));
    }

    #[test]
    fn test_suite() {
        let mut fmt = CodeFormatter::new("    ");
        fmt.suite("for i in range(0, 4, 1):", |f| {
            f.writeln("pass");
        });
        assert_eq!(fmt.finish(), "for i in range(0, 4, 1):\n    pass\n");
    }

    struct Pair(&'static str, &'static str);

    impl PrettyPrint for Pair {
        fn to_doc(&self) -> RcDoc<'_, ()> {
            RcDoc::text(self.0)
                .append(RcDoc::line())
                .append(RcDoc::text(self.1))
                .group()
        }
    }

    #[test]
    fn test_pretty_width() {
        let pair = Pair("alpha", "beta");
        assert_eq!(pair.pretty(), "alpha beta");
        assert_eq!(pair.pretty_print(4), "alpha\nbeta");
    }
}
