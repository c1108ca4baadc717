//! Unit tests for external command parsing.

use prochive::{AppError, ExternalCommand};

#[test]
fn bare_tokens_split_on_whitespace() {
    let command = ExternalCommand::parse("  /usr/bin/env   FOO=1 worker --fast ").unwrap();
    assert_eq!(command.program(), "/usr/bin/env");
    assert_eq!(command.args(), ["FOO=1", "worker", "--fast"]);
    assert_eq!(command.raw(), "/usr/bin/env   FOO=1 worker --fast");
}

#[test]
fn quoted_tokens_keep_spaces_and_lose_quotes() {
    let command =
        ExternalCommand::parse(r#"consume --topic 'orders v2' --label "a b c""#).unwrap();
    assert_eq!(command.program(), "consume");
    assert_eq!(command.args(), ["--topic", "orders v2", "--label", "a b c"]);
}

#[test]
fn chaining_operators_are_rejected() {
    for raw in ["make && ./serve", "serve || true", "serve&&other"] {
        let err = ExternalCommand::parse(raw).expect_err(raw);
        assert!(matches!(err, AppError::Config(_)), "{raw}");
    }
}

#[test]
fn operators_inside_quotes_are_plain_arguments() {
    let command = ExternalCommand::parse("echo '&&' \"||\"").unwrap();
    assert_eq!(command.args(), ["&&", "||"]);
}

#[test]
fn empty_command_is_rejected() {
    assert!(matches!(
        ExternalCommand::parse("   "),
        Err(AppError::Config(_))
    ));
}
