//! Command-line construction compatible with the argv splitting performed by
//! `CommandLineToArgvW` and the Microsoft C runtime.
//!
//! Arguments are kept as discrete elements until the last possible moment and
//! only joined into the single command-line string the OS requires. No shell
//! string evaluation is ever involved.

use std::borrow::Cow;

enum RequiredQuotes {
    None,
    Simple,
    Escaped,
}

/// Escapes one argument so that native argv splitting reproduces it exactly.
///
/// An argument with no whitespace, quote, or backslash passes through
/// unchanged. One containing only whitespace is wrapped in quotes as-is.
/// Anything containing a quote or backslash goes through the full escape,
/// where runs of backslashes are doubled when they precede a quote (literal
/// or closing).
pub fn escape(argument: &str) -> Cow<'_, str> {
    match requires_quotes(argument) {
        RequiredQuotes::None => Cow::Borrowed(argument),
        quotes => {
            let mut out = String::with_capacity(argument.len() + 2);
            quote_argument(&mut out, argument, quotes);
            Cow::Owned(out)
        }
    }
}

/// Escapes `argument` and appends it to `out`.
pub fn escape_into(out: &mut String, argument: &str) {
    match requires_quotes(argument) {
        RequiredQuotes::None => out.push_str(argument),
        quotes => quote_argument(out, argument, quotes),
    }
}

/// Builds the full command line from an executable path and either a raw
/// argument tail (used verbatim) or a list of arguments (each escaped).
/// Callers must not supply both; `Process` validation rejects that before
/// this function runs.
pub fn build_command_line(file_name: &str, arguments: Option<&str>, argument_list: &[String]) -> String {
    let file_name = file_name.trim();
    let mut command_line = String::with_capacity(file_name.len() + 16);

    let quoted = file_name.starts_with('"') && file_name.ends_with('"') && file_name.len() >= 2;
    if !quoted && file_name.contains(' ') {
        command_line.push('"');
        command_line.push_str(file_name);
        command_line.push('"');
    } else {
        command_line.push_str(file_name);
    }

    if !argument_list.is_empty() {
        for argument in argument_list {
            command_line.push(' ');
            escape_into(&mut command_line, argument);
        }
    } else if let Some(arguments) = arguments.filter(|a| !a.is_empty()) {
        command_line.push(' ');
        command_line.push_str(arguments);
    }

    command_line
}

fn quote_argument(out: &mut String, argument: &str, quotes: RequiredQuotes) {
    match quotes {
        RequiredQuotes::None => out.push_str(argument),
        RequiredQuotes::Simple => {
            out.push('"');
            out.push_str(argument);
            out.push('"');
        }
        RequiredQuotes::Escaped => {
            out.push('"');
            let chars: Vec<char> = argument.chars().collect();
            let mut index = 0;
            loop {
                let mut backslashes = 0;
                while index < chars.len() && chars[index] == '\\' {
                    index += 1;
                    backslashes += 1;
                }

                if index == chars.len() {
                    // backslashes at the very end precede our closing quote
                    push_repeated(out, '\\', backslashes * 2);
                    break;
                } else if chars[index] == '"' {
                    push_repeated(out, '\\', backslashes * 2 + 1);
                    out.push('"');
                } else {
                    push_repeated(out, '\\', backslashes);
                    out.push(chars[index]);
                }
                index += 1;
            }
            out.push('"');
        }
    }
}

fn push_repeated(out: &mut String, ch: char, count: usize) {
    for _ in 0..count {
        out.push(ch);
    }
}

fn requires_quotes(argument: &str) -> RequiredQuotes {
    if argument.is_empty() {
        return RequiredQuotes::Simple;
    }

    let mut whitespace = 0;
    for ch in argument.chars() {
        match ch {
            ' ' | '\t' | '\n' | '\u{0B}' => whitespace += 1,
            '"' | '\\' => return RequiredQuotes::Escaped,
            _ => {}
        }
    }

    if whitespace > 0 {
        RequiredQuotes::Simple
    } else {
        RequiredQuotes::None
    }
}
