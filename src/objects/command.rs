//! Command templating: turning a `name!arg1!arg2` check reference plus a
//! command definition into the line handed to a worker.
//!
//! Only the macros the engine itself needs are expanded; anything
//! unrecognized expands to the empty string, the same forgiving behavior
//! monitoring plugins have relied on for decades.

use crate::core::errors::{FmError, Result};

/// Values available to macro expansion for one check.
#[derive(Debug, Default, Clone, Copy)]
pub struct MacroContext<'a> {
    /// `$HOSTNAME$`
    pub host_name: &'a str,
    /// `$HOSTADDRESS$` (falls back to the host name when empty)
    pub host_address: &'a str,
    /// `$SERVICEDESC$`, service checks only
    pub service_description: Option<&'a str>,
    /// `$ARG1$` .. `$ARGn$` from the `!`-separated check reference
    pub args: &'a [String],
    /// Custom variables, matched by upper-cased name
    pub custom: &'a [(String, String)],
}

/// Split a `name!arg1!arg2` check reference into the command name and its
/// positional arguments.
#[must_use]
pub fn split_check_reference(reference: &str) -> (&str, Vec<String>) {
    let mut parts = reference.split('!');
    let name = parts.next().unwrap_or_default();
    (name, parts.map(str::to_string).collect())
}

/// Expand `$MACRO$` occurrences in `template`.
///
/// `$$` yields a literal `$`. An unterminated macro is a hard error: the
/// resulting command line would be garbage and must not reach a worker.
pub fn expand_macros(template: &str, ctx: &MacroContext<'_>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('$') else {
            return Err(FmError::MacroExpansion {
                template: template.to_string(),
                details: "unterminated macro".to_string(),
            });
        };
        let name = &after[..end];
        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&expand_one(name, ctx));
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn expand_one(name: &str, ctx: &MacroContext<'_>) -> String {
    match name {
        "HOSTNAME" => ctx.host_name.to_string(),
        "HOSTADDRESS" => {
            if ctx.host_address.is_empty() {
                ctx.host_name.to_string()
            } else {
                ctx.host_address.to_string()
            }
        }
        "SERVICEDESC" => ctx.service_description.unwrap_or_default().to_string(),
        _ => {
            if let Some(n) = name.strip_prefix("ARG") {
                if let Ok(idx) = n.parse::<usize>() {
                    if idx >= 1 {
                        return ctx.args.get(idx - 1).cloned().unwrap_or_default();
                    }
                }
                return String::new();
            }
            ctx.custom
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(args: &'a [String], custom: &'a [(String, String)]) -> MacroContext<'a> {
        MacroContext {
            host_name: "web01",
            host_address: "10.0.0.5",
            service_description: Some("HTTP"),
            args,
            custom,
        }
    }

    #[test]
    fn expands_standard_macros_and_args() {
        let args = vec!["80".to_string(), "/health".to_string()];
        let out = expand_macros(
            "/usr/lib/check_http -H $HOSTADDRESS$ -p $ARG1$ -u $ARG2$ -d $SERVICEDESC$",
            &ctx(&args, &[]),
        )
        .unwrap();
        assert_eq!(
            out,
            "/usr/lib/check_http -H 10.0.0.5 -p 80 -u /health -d HTTP"
        );
    }

    #[test]
    fn unknown_macros_expand_empty_and_dollar_escapes() {
        let out = expand_macros("a $NOPE$ b $$5", &ctx(&[], &[])).unwrap();
        assert_eq!(out, "a  b $5");
    }

    #[test]
    fn custom_variables_match_case_insensitively() {
        let custom = vec![("_HOSTSNMPCOMMUNITY".to_string(), "public".to_string())];
        let out = expand_macros("-c $_HOSTSNMPCOMMUNITY$", &ctx(&[], &custom)).unwrap();
        assert_eq!(out, "-c public");
    }

    #[test]
    fn unterminated_macro_is_an_error() {
        let err = expand_macros("check $HOSTNAME", &ctx(&[], &[])).unwrap_err();
        assert_eq!(err.code(), "FM-2003");
    }

    #[test]
    fn check_reference_splits_on_bang() {
        let (name, args) = split_check_reference("check_ping!100.0,20%!500.0,60%");
        assert_eq!(name, "check_ping");
        assert_eq!(args, vec!["100.0,20%", "500.0,60%"]);
    }
}
