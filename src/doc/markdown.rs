//! Markdown lowering. The parser turns Markdown into the flat
//! [`BlockSpec`]s the block factories consume, and the renderer turns a
//! `BlockSpec` sequence back into Markdown so content read out of a
//! document can be compared against what was written (round-trip up to
//! whitespace).
//!
//! Inline markup is preserved textually: emphasis, code spans and links
//! are re-emitted with their markers inside the text rather than modeled
//! structurally, which keeps [`BlockSpec`] at the block level.

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag};

/// One flat block yielded by lowering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSpec {
    /// `level` 0 is body text, 1–3 are headings.
    Paragraph { level: u8, text: String },
    Quote { text: String },
    ListItem { ordered: bool, text: String },
    Code { language: String, code: String },
    /// Header row first, then body rows.
    Table { rows: Vec<Vec<String>> },
}

enum Frame {
    Paragraph { level: u8, text: String },
    Quote,
    Code { language: String, text: String },
    List { ordered: bool },
    Item { text: String },
    Table { rows: Vec<Vec<String>> },
    Row { cells: Vec<String> },
    Cell { text: String },
    Inline { suffix: String },
    Other,
}

struct Lowering {
    frames: Vec<Frame>,
    specs: Vec<BlockSpec>,
}

impl Lowering {
    fn push_text(&mut self, chunk: &str) {
        for frame in self.frames.iter_mut().rev() {
            match frame {
                Frame::Paragraph { text, .. }
                | Frame::Code { text, .. }
                | Frame::Item { text }
                | Frame::Cell { text } => {
                    text.push_str(chunk);
                    return;
                }
                _ => {}
            }
        }
    }

    fn nearest_list_ordered(&self) -> bool {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| match frame {
                Frame::List { ordered } => Some(*ordered),
                _ => None,
            })
            .unwrap_or(false)
    }

    fn start(&mut self, tag: Tag<'_>) {
        let frame = match tag {
            Tag::Paragraph => Frame::Paragraph {
                level: 0,
                text: String::new(),
            },
            Tag::Heading { level, .. } => Frame::Paragraph {
                level: heading_level(level),
                text: String::new(),
            },
            Tag::BlockQuote(_) => Frame::Quote,
            Tag::CodeBlock(kind) => {
                let language = match kind {
                    CodeBlockKind::Fenced(lang) => lang.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                Frame::Code {
                    language,
                    text: String::new(),
                }
            }
            Tag::List(start) => Frame::List {
                ordered: start.is_some(),
            },
            Tag::Item => Frame::Item {
                text: String::new(),
            },
            Tag::Table(_) => Frame::Table { rows: Vec::new() },
            Tag::TableHead | Tag::TableRow => Frame::Row { cells: Vec::new() },
            Tag::TableCell => Frame::Cell {
                text: String::new(),
            },
            Tag::Emphasis => {
                self.push_text("*");
                Frame::Inline {
                    suffix: "*".to_owned(),
                }
            }
            Tag::Strong => {
                self.push_text("**");
                Frame::Inline {
                    suffix: "**".to_owned(),
                }
            }
            Tag::Strikethrough => {
                self.push_text("~~");
                Frame::Inline {
                    suffix: "~~".to_owned(),
                }
            }
            Tag::Link { dest_url, .. } => {
                self.push_text("[");
                Frame::Inline {
                    suffix: format!("]({dest_url})"),
                }
            }
            Tag::Image { dest_url, .. } => {
                self.push_text("![");
                Frame::Inline {
                    suffix: format!("]({dest_url})"),
                }
            }
            _ => Frame::Other,
        };
        self.frames.push(frame);
    }

    /// Events are well nested, so any `End` closes the most recent frame.
    fn end(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };

        match frame {
            Frame::Paragraph { level, text } => {
                let text = text.trim().to_owned();
                if text.is_empty() {
                    return;
                }

                // A paragraph belongs to the nearest enclosing item (loose
                // lists wrap item text in paragraphs) or quote; otherwise
                // it stands on its own.
                enum Target {
                    Doc,
                    Quote,
                    Item(usize),
                }
                let mut target = Target::Doc;
                for (position, frame) in self.frames.iter().enumerate().rev() {
                    match frame {
                        Frame::Item { .. } => {
                            target = Target::Item(position);
                            break;
                        }
                        Frame::Quote => {
                            target = Target::Quote;
                            break;
                        }
                        _ => {}
                    }
                }

                match target {
                    Target::Item(position) => {
                        if let Frame::Item { text: item_text } = &mut self.frames[position] {
                            if !item_text.is_empty() {
                                item_text.push(' ');
                            }
                            item_text.push_str(&text);
                        }
                    }
                    Target::Quote if level == 0 => self.specs.push(BlockSpec::Quote { text }),
                    Target::Quote | Target::Doc => {
                        self.specs.push(BlockSpec::Paragraph { level, text });
                    }
                }
            }
            Frame::Item { text } => {
                let text = text.trim().to_owned();
                if !text.is_empty() {
                    self.specs.push(BlockSpec::ListItem {
                        ordered: self.nearest_list_ordered(),
                        text,
                    });
                }
            }
            Frame::Code { language, text } => {
                self.specs.push(BlockSpec::Code {
                    language,
                    code: text.trim_end_matches('\n').to_owned(),
                });
            }
            Frame::Cell { text } => {
                if let Some(Frame::Row { cells }) = self.frames.last_mut() {
                    cells.push(text.trim().to_owned());
                }
            }
            Frame::Row { cells } => {
                if let Some(Frame::Table { rows }) = self.frames.last_mut() {
                    rows.push(cells);
                }
            }
            Frame::Table { rows } => {
                self.specs.push(BlockSpec::Table { rows });
            }
            Frame::Inline { suffix } => self.push_text(&suffix),
            Frame::Quote | Frame::List { .. } | Frame::Other => {}
        }
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        // Heading depth is capped at three.
        _ => 3,
    }
}

/// Lowers a Markdown string into flat block specifications.
pub fn parse(markdown: &str) -> Vec<BlockSpec> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let mut lowering = Lowering {
        frames: Vec::new(),
        specs: Vec::new(),
    };

    for event in Parser::new_ext(markdown, options) {
        match event {
            Event::Start(tag) => lowering.start(tag),
            Event::End(_) => lowering.end(),
            Event::Text(text) => lowering.push_text(&text),
            Event::Code(code) => lowering.push_text(&format!("`{code}`")),
            Event::SoftBreak | Event::HardBreak => lowering.push_text(" "),
            _ => {}
        }
    }

    lowering.specs
}

/// Renders block specifications back to Markdown. `parse(render(specs))`
/// yields the same specs; rendered output matches the source Markdown up to
/// whitespace normalisation.
pub fn render(specs: &[BlockSpec]) -> String {
    let mut blocks: Vec<String> = Vec::new();
    let mut index = 0;

    while index < specs.len() {
        match &specs[index] {
            BlockSpec::Paragraph { level: 0, text } => blocks.push(text.clone()),
            BlockSpec::Paragraph { level, text } => {
                blocks.push(format!("{} {}", "#".repeat(*level as usize), text));
            }
            BlockSpec::Quote { text } => blocks.push(format!("> {text}")),
            BlockSpec::ListItem { ordered, .. } => {
                // Consecutive items of the same kind form one list block.
                let ordered = *ordered;
                let mut lines = Vec::new();
                while let Some(BlockSpec::ListItem { ordered: o, text }) = specs.get(index) {
                    if *o != ordered {
                        break;
                    }
                    if ordered {
                        lines.push(format!("{}. {}", lines.len() + 1, text));
                    } else {
                        lines.push(format!("- {text}"));
                    }
                    index += 1;
                }
                index -= 1;
                blocks.push(lines.join("\n"));
            }
            BlockSpec::Code { language, code } => {
                blocks.push(format!("```{language}\n{code}\n```"));
            }
            BlockSpec::Table { rows } => {
                let mut lines = Vec::new();
                if let Some(header) = rows.first() {
                    lines.push(format_row(header));
                    lines.push(format!(
                        "|{}",
                        " --- |".repeat(header.len().max(1))
                    ));
                    for row in &rows[1..] {
                        lines.push(format_row(row));
                    }
                }
                blocks.push(lines.join("\n"));
            }
        }
        index += 1;
    }

    blocks.join("\n\n")
}

fn format_row(cells: &[String]) -> String {
    let mut line = String::from("|");
    for cell in cells {
        line.push(' ');
        line.push_str(cell);
        line.push_str(" |");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn normalize(markdown: &str) -> String {
        markdown
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != ">")
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn lowers_headings_and_paragraphs() {
        let specs = parse("# Hello\n\nworld");
        assert_eq!(
            specs,
            vec![
                BlockSpec::Paragraph {
                    level: 1,
                    text: "Hello".to_owned()
                },
                BlockSpec::Paragraph {
                    level: 0,
                    text: "world".to_owned()
                },
            ]
        );
    }

    #[test]
    fn lowers_lists_code_quote_table() {
        let markdown = "\
# Notes

- first
- second

1. one
2. two

> quoted line

```rust
fn main() {}
```

| a | b |
| --- | --- |
| 1 | 2 |
";
        let specs = parse(markdown);
        assert_eq!(
            specs,
            vec![
                BlockSpec::Paragraph {
                    level: 1,
                    text: "Notes".to_owned()
                },
                BlockSpec::ListItem {
                    ordered: false,
                    text: "first".to_owned()
                },
                BlockSpec::ListItem {
                    ordered: false,
                    text: "second".to_owned()
                },
                BlockSpec::ListItem {
                    ordered: true,
                    text: "one".to_owned()
                },
                BlockSpec::ListItem {
                    ordered: true,
                    text: "two".to_owned()
                },
                BlockSpec::Quote {
                    text: "quoted line".to_owned()
                },
                BlockSpec::Code {
                    language: "rust".to_owned(),
                    code: "fn main() {}".to_owned()
                },
                BlockSpec::Table {
                    rows: vec![
                        vec!["a".to_owned(), "b".to_owned()],
                        vec!["1".to_owned(), "2".to_owned()],
                    ]
                },
            ]
        );
    }

    #[test]
    fn loose_list_items_fold_their_paragraphs() {
        let specs = parse("- first\n\n- second");
        assert_eq!(
            specs,
            vec![
                BlockSpec::ListItem {
                    ordered: false,
                    text: "first".to_owned()
                },
                BlockSpec::ListItem {
                    ordered: false,
                    text: "second".to_owned()
                },
            ]
        );
    }

    #[test]
    fn inline_markup_is_preserved_textually() {
        let specs = parse("some **bold** and *soft* and `code` and [link](https://x.dev)");
        assert_eq!(
            specs,
            vec![BlockSpec::Paragraph {
                level: 0,
                text: "some **bold** and *soft* and `code` and [link](https://x.dev)".to_owned()
            }]
        );
    }

    #[test]
    fn round_trip_is_whitespace_stable() {
        let inputs = [
            "# Hello\n\nworld",
            "## Title\n\n- a\n- b\n\n1. x\n2. y",
            "> a quote\n\nplain **bold** tail",
            "```python\nprint(1)\n```",
            "| h1 | h2 |\n| --- | --- |\n| a | b |",
        ];
        for input in inputs {
            let rendered = render(&parse(input));
            assert_eq!(normalize(&rendered), normalize(input), "input: {input:?}");
        }
    }

    #[test]
    fn round_trip_is_spec_stable() {
        let markdown = "# T\n\npara\n\n- one\n- two\n\n```js\nlet a = 1;\n```";
        let specs = parse(markdown);
        assert_eq!(parse(&render(&specs)), specs);
    }
}
