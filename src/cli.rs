//! Command-line interface definitions for proxywrap.
//!
//! Uses clap's derive API for type-safe argument parsing. Wrapper options go
//! before the tool name; a handful are also recognised after it (see
//! [`Cli::into_invocation`]) so proxywrap can stand in for a tool in existing
//! scripts that already pass those flags.

use crate::auth::AuthMechanism;
use clap::Parser;
use std::path::PathBuf;

/// Run a command-line tool with all of its HTTP(S) traffic routed through a
/// local intercepting proxy.
///
/// The tool is launched with `HTTPS_PROXY` pointing at a loopback proxy and
/// with trust-store variables naming a certificate bundle that includes the
/// proxy's interception root. Outbound connections can be chained through an
/// authenticated corporate proxy.
#[derive(Parser, Debug)]
#[command(name = "proxywrap")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Skip TLS certificate verification towards destinations.
    #[arg(long = "insecure")]
    pub insecure: bool,

    /// Upstream (corporate) proxy, e.g. `http://proxy.corp:3128`.
    ///
    /// Credentials for Basic authentication may be given as userinfo.
    #[arg(long = "proxy", value_name = "URL")]
    pub proxy: Option<String>,

    /// Authenticate to the upstream proxy with Negotiate only.
    #[arg(long = "proxy-negotiate")]
    pub proxy_negotiate: bool,

    /// Never answer upstream proxy authentication challenges.
    #[arg(long = "proxy-noauth")]
    pub proxy_noauth: bool,

    /// Directory for the persisted interception root.
    #[arg(long = "cache-dir", env = "PROXYWRAP_CACHE_PATH", value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Debug logging (same as -vv). Also passed on to the tool.
    #[arg(long = "debug")]
    pub debug: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Tool to launch (name on PATH or path to an executable), followed by
    /// its arguments.
    ///
    /// Everything after the tool name is passed through to the tool, apart
    /// from --insecure, --proxy, --proxy-negotiate and --proxy-noauth.
    #[arg(required = true, trailing_var_arg = true, value_name = "TOOL [ARGS]")]
    pub command: Vec<String>,
}

/// A parsed command line with wrapper flags separated from tool arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Tool to launch.
    pub tool: String,
    /// Arguments forwarded to the tool, in order.
    pub tool_args: Vec<String>,
    /// `--insecure` was given.
    pub insecure: bool,
    /// Upstream proxy from `--proxy`.
    pub proxy: Option<String>,
    /// Mechanism chosen on the command line, if any.
    pub auth: Option<AuthMechanism>,
    /// Cache directory from `--cache-dir` or `PROXYWRAP_CACHE_PATH`.
    pub cache_dir: Option<PathBuf>,
    /// Extra config file from `--config`.
    pub config: Option<PathBuf>,
    /// `--debug` was given.
    pub debug: bool,
    /// Number of `-v` flags.
    pub verbose: u8,
}

impl Cli {
    /// Split wrapper flags out of the tool arguments.
    ///
    /// `--insecure`, `--proxy=<URL>`, `--proxy <URL>`, `--proxy-negotiate`
    /// and `--proxy-noauth` after the tool name are consumed. `--debug` is
    /// honoured and still forwarded.
    pub fn into_invocation(self) -> Invocation {
        let mut insecure = self.insecure;
        let mut proxy = self.proxy;
        let mut negotiate = self.proxy_negotiate;
        let mut noauth = self.proxy_noauth;
        let mut debug = self.debug;
        let mut args = self.command.into_iter();
        let tool = args.next().unwrap_or_default();
        let mut tool_args = Vec::with_capacity(args.len());

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--insecure" => insecure = true,
                "--proxy-negotiate" => negotiate = true,
                "--proxy-noauth" => noauth = true,
                "--proxy" => {
                    if let Some(value) = args.next() {
                        proxy = Some(value);
                    }
                }
                "--debug" => {
                    debug = true;
                    tool_args.push(arg);
                }
                _ => match arg.strip_prefix("--proxy=") {
                    Some(value) => proxy = Some(value.to_string()),
                    None => tool_args.push(arg),
                },
            }
        }

        let auth = if noauth {
            Some(AuthMechanism::None)
        } else if negotiate {
            Some(AuthMechanism::Negotiate)
        } else {
            None
        };

        Invocation {
            tool,
            tool_args,
            insecure,
            proxy,
            auth,
            cache_dir: self.cache_dir,
            config: self.config,
            debug,
            verbose: self.verbose,
        }
    }
}

impl Invocation {
    /// Effective `-v` count, with `--debug` counting as `-vv`.
    pub fn verbosity(&self) -> u8 {
        if self.debug {
            self.verbose.max(2)
        } else {
            self.verbose
        }
    }
}
