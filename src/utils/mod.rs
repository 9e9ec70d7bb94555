//! Utilities
//!
//! Bounded stream filters used on process and unit output.

pub mod limited_input;
pub mod output;
pub mod prefix;

/// Join command arguments into one loggable line
pub fn merge_one_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("'{}'", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
