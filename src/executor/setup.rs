//! Guest-side layout and the commands that prepare a guest for a run
//!
//! ```text
//! /tmp/sandbox-runner/
//!   ├── run-agent.sh     wrapper: source env, run agent, write exit code
//!   ├── env              export NAME='value' lines
//!   ├── agent.log        wrapper stdout+stderr
//!   ├── agent.pid        wrapper PID
//!   ├── exit-code        sentinel, renamed into place when the agent exits
//!   └── lib/             extra guest scripts shipped by the runner
//! ```

use std::net::IpAddr;

use crate::guest::shell::{quote, render_env_file};
use crate::protocol::{ExecutionContext, StorageEntry};

pub const GUEST_DIR: &str = "/tmp/sandbox-runner";
pub const SENTINEL_PATH: &str = "/tmp/sandbox-runner/exit-code";
pub const MAIN_LOG_PATH: &str = "/tmp/sandbox-runner/agent.log";
pub const ENV_FILE_PATH: &str = "/tmp/sandbox-runner/env";
pub const RUN_SCRIPT_PATH: &str = "/tmp/sandbox-runner/run-agent.sh";
pub const PID_FILE_PATH: &str = "/tmp/sandbox-runner/agent.pid";
pub const GUEST_LIB_DIR: &str = "/tmp/sandbox-runner/lib";

/// Where the proxy CA lands in the guest trust store
pub const GUEST_CA_PATH: &str = "/usr/local/share/ca-certificates/sandbox-runner-proxy.crt";

/// Bundle rebuilt by `update-ca-certificates`
const GUEST_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Wrapper that runs the agent and records its exit code
///
/// The exit code is written to a temp file and renamed, so a reader sees
/// either no sentinel or a complete one.
pub fn run_script(ctx: &ExecutionContext, agent_command: &str) -> String {
    format!(
        "#!/bin/sh\n\
         . {env}\n\
         cd {workdir} || exit 1\n\
         {agent} --cli {cli}\n\
         code=$?\n\
         printf '%s' \"$code\" > {sentinel}.tmp\n\
         mv {sentinel}.tmp {sentinel}\n\
         exit \"$code\"\n",
        env = ENV_FILE_PATH,
        workdir = quote(&ctx.working_dir),
        agent = agent_command,
        cli = ctx.cli_agent_type.as_str(),
        sentinel = SENTINEL_PATH,
    )
}

/// Environment the agent wrapper sources
///
/// Runner-provided names are exported last and win over user vars of the
/// same name. Secrets are exported under their own names.
pub fn env_file(ctx: &ExecutionContext, api_url: &str, deep_inspection: bool) -> String {
    let mut vars: Vec<(&str, &str)> = ctx
        .vars
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    vars.extend(ctx.secrets.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    vars.push(("SANDBOX_RUN_ID", &ctx.run_id));
    vars.push(("SANDBOX_TOKEN", &ctx.sandbox_token));
    vars.push(("SANDBOX_API_URL", api_url));
    vars.push(("SANDBOX_PROMPT", &ctx.prompt));
    vars.push(("SANDBOX_WORKING_DIR", &ctx.working_dir));
    vars.push(("SANDBOX_CLI_AGENT", ctx.cli_agent_type.as_str()));
    if let Some(session) = &ctx.resume_session {
        vars.push(("SANDBOX_RESUME_SESSION_ID", &session.session_id));
    }
    if deep_inspection {
        vars.push(("NODE_EXTRA_CA_CERTS", GUEST_CA_PATH));
        vars.push(("SSL_CERT_FILE", GUEST_CA_BUNDLE));
        vars.push(("REQUESTS_CA_BUNDLE", GUEST_CA_BUNDLE));
    }

    render_env_file(vars)
}

/// Start the wrapper detached and print its PID
pub fn launch_command() -> String {
    format!(
        "nohup sh {script} > {log} 2>&1 < /dev/null & pid=$!; echo \"$pid\" > {pidfile}; echo \"$pid\"",
        script = RUN_SCRIPT_PATH,
        log = MAIN_LOG_PATH,
        pidfile = PID_FILE_PATH,
    )
}

/// `/etc/resolv.conf` contents
pub fn resolv_conf(servers: &[IpAddr]) -> String {
    servers
        .iter()
        .map(|s| format!("nameserver {}\n", s))
        .collect()
}

pub fn ca_install_command() -> &'static str {
    "update-ca-certificates >/dev/null 2>&1"
}

/// Download and unpack one storage archive
///
/// Entries without an archive only get their mount directory.
pub fn storage_restore_command(index: usize, entry: &StorageEntry) -> String {
    let mount = quote(&entry.mount_path);
    match &entry.archive_url {
        None => format!("mkdir -p {}", mount),
        Some(url) => {
            let archive = format!("{}/storage-{}.tar.gz", GUEST_DIR, index);
            format!(
                "mkdir -p {mount} && curl -fsSL --retry 3 -o {archive} {url} && tar -xzf {archive} -C {mount} && rm -f {archive}",
                mount = mount,
                archive = archive,
                url = quote(url),
            )
        }
    }
}

/// Guest path of the restored transcript
pub fn session_transcript_path(mount_path: &str, session_id: &str) -> String {
    format!("{}/{}.jsonl", mount_path.trim_end_matches('/'), session_id)
}

/// Sentinel, liveness and exit in one round trip
///
/// Prints `exit:<code>`, `alive` or `dead`.
pub fn status_probe_command() -> String {
    format!(
        "if [ -f {s} ]; then printf 'exit:%s\\n' \"$(cat {s})\"; \
         elif kill -0 \"$(cat {p} 2>/dev/null)\" 2>/dev/null; then echo alive; \
         else echo dead; fi",
        s = SENTINEL_PATH,
        p = PID_FILE_PATH,
    )
}

pub fn sentinel_read_command() -> String {
    format!("cat {} 2>/dev/null", SENTINEL_PATH)
}

/// OOM-killer lines from the guest kernel log
pub fn oom_probe_command() -> &'static str {
    "dmesg 2>/dev/null | grep -iE 'out of memory|oom-kill|killed process' | tail -n 5"
}

pub fn log_tail_command(lines: usize) -> String {
    format!("tail -n {} {} 2>/dev/null", lines, MAIN_LOG_PATH)
}
