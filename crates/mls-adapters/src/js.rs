/// JavaScript minification. Text-in/text-out. The output keeps one
/// statement per line so automatic semicolon insertion never changes
/// meaning.
pub trait JsMinifier: Send + Sync {
    fn minify(&self, js: &str) -> String;
}

pub struct BuiltinJsMinifier;

impl JsMinifier for BuiltinJsMinifier {
    fn minify(&self, js: &str) -> String {
        let stripped = strip_js_comments(js);
        stripped
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Removes `//` and `/* */` comments while respecting string and template
/// literals.
fn strip_js_comments(js: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        Line,
        Block,
        Single,
        Double,
        Template,
    }
    let mut out = String::with_capacity(js.len());
    let mut state = State::Code;
    let mut chars = js.chars().peekable();
    while let Some(ch) = chars.next() {
        match state {
            State::Code => match ch {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::Line;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::Block;
                }
                '\'' => {
                    out.push(ch);
                    state = State::Single;
                }
                '"' => {
                    out.push(ch);
                    state = State::Double;
                }
                '`' => {
                    out.push(ch);
                    state = State::Template;
                }
                _ => out.push(ch),
            },
            State::Line => {
                if ch == '\n' {
                    out.push('\n');
                    state = State::Code;
                }
            }
            State::Block => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                }
            }
            State::Single => {
                out.push(ch);
                if ch == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if ch == '\'' {
                    state = State::Code;
                }
            }
            State::Double => {
                out.push(ch);
                if ch == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if ch == '"' {
                    state = State::Code;
                }
            }
            State::Template => {
                out.push(ch);
                if ch == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if ch == '`' {
                    state = State::Code;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_and_blank_lines() {
        let js = "// header\nvar a = 1; /* note */\n\n  var b = 2;\n";
        assert_eq!(BuiltinJsMinifier.minify(js), "var a = 1;\nvar b = 2;");
    }

    #[test]
    fn string_contents_are_untouched() {
        let js = "var url = \"https://example.test/path\"; // trailing";
        assert_eq!(
            BuiltinJsMinifier.minify(js),
            "var url = \"https://example.test/path\";"
        );
    }

    #[test]
    fn template_literals_keep_inner_text() {
        let js = "let t = `a // not comment`;";
        assert_eq!(BuiltinJsMinifier.minify(js), "let t = `a // not comment`;");
    }
}
