//! Helpers for generating POSIX shell script text.

/// Quote `text` so a POSIX shell treats it as a single literal word.
///
/// # Examples
///
/// ```
/// use clusterboot::shell::sh_quote;
///
/// assert_eq!(sh_quote("it's"), r#"'it'"'"'s'"#);
/// ```
#[must_use]
pub fn sh_quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('\'');
    quoted.push_str(&text.replace('\'', r#"'"'"'"#));
    quoted.push('\'');
    quoted
}

/// Script prefix that copies `path` to stderr if the script exits non-zero.
///
/// Prepending this to a configuration script means a failed run carries the
/// log needed to diagnose it, without opening a second session.
#[must_use]
pub fn dump_file_on_error_script(path: &str) -> String {
    let quoted = sh_quote(path);
    format!(
        r"
dump_file() {{
    code=$?
    if [ $code -ne 0 -a -e {quoted} ]; then
        cat {quoted} >&2
    fi
    exit $code
}}
trap dump_file EXIT
"
    )
}

/// Script fragment writing `contents` to `path` with the given octal mode.
#[must_use]
pub fn write_file_script(path: &str, mode: u32, contents: &str) -> String {
    let quoted = sh_quote(path);
    format!(
        "install -D -m {mode:o} /dev/null {quoted}\nprintf '%s\\n' {} > {quoted}\n",
        sh_quote(contents)
    )
}
