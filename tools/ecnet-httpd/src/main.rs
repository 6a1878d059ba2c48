// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ecnet contributors

//! Static-file HTTP/WS server over the ecnet stack, with the classic
//! pidfile service frame: `-install | -uninstall | -start | -stop |
//! -status | -version`. WebSocket messages are echoed back, which
//! makes the binary a convenient interop target.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;

use ecnet::config::{HttpConfig, ServerConfig, UcpConfig};
use ecnet::server::http::HttpServer;
use ecnet::server::ServerEvent;
use ecnet::ucp::{UcpEndpoint, UcpEvent};

static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "ecnet-httpd", version, about)]
struct Cli {
    /// Service action: -install | -uninstall | -start | -stop |
    /// -status | -version (default: -start in the foreground).
    #[arg(allow_hyphen_values = true)]
    command: Option<String>,

    /// Document root served beneath `/`.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// HTTP/WS listen port.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Bind address (default: all interfaces).
    #[arg(long)]
    bind: Option<std::net::IpAddr>,

    /// Also run a UCP echo endpoint on this UDP port.
    #[arg(long)]
    ucp_port: Option<u16>,

    /// TLS certificate chain (PEM); enables the TLS upgrade path.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS private key (PEM).
    #[arg(long)]
    key: Option<PathBuf>,

    /// Additional root/chain certificates (PEM).
    #[arg(long)]
    ca_root: Option<PathBuf>,

    /// Basic auth credential as user:password.
    #[arg(long)]
    auth: Option<String>,

    /// Pidfile used by the service frame.
    #[arg(long, default_value = "/run/ecnet-httpd.pid")]
    pidfile: PathBuf,

    /// With -start: detach into the background.
    #[arg(long)]
    daemon: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let command = cli.command.as_deref().unwrap_or("-start");
    match command.trim_start_matches('-') {
        "version" => {
            println!("ecnet-httpd {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        "status" => cmd_status(&cli),
        "stop" => cmd_stop(&cli),
        "install" => cmd_install(&cli),
        "uninstall" => cmd_uninstall(&cli),
        "start" => cmd_start(&cli),
        other => {
            eprintln!("unknown command: {}", other);
            ExitCode::FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// Service frame
// ---------------------------------------------------------------------------

fn read_pid(cli: &Cli) -> Option<i32> {
    let text = std::fs::read_to_string(&cli.pidfile).ok()?;
    text.trim().parse().ok()
}

fn pid_alive(pid: i32) -> bool {
    // SAFETY: kill with signal 0 only probes for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

fn cmd_status(cli: &Cli) -> ExitCode {
    match read_pid(cli) {
        Some(pid) if pid_alive(pid) => {
            println!("ecnet-httpd is running (pid {})", pid);
            ExitCode::SUCCESS
        }
        Some(pid) => {
            println!("ecnet-httpd is not running (stale pidfile, pid {})", pid);
            ExitCode::from(3)
        }
        None => {
            println!("ecnet-httpd is not running");
            ExitCode::from(3)
        }
    }
}

fn cmd_stop(cli: &Cli) -> ExitCode {
    match read_pid(cli) {
        Some(pid) if pid_alive(pid) => {
            // SAFETY: well-formed pid from our own pidfile.
            let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
            if rc == 0 {
                println!("sent SIGTERM to pid {}", pid);
                let _ = std::fs::remove_file(&cli.pidfile);
                ExitCode::SUCCESS
            } else {
                eprintln!("failed to signal pid {}", pid);
                ExitCode::FAILURE
            }
        }
        _ => {
            eprintln!("ecnet-httpd is not running");
            ExitCode::FAILURE
        }
    }
}

const UNIT_PATH: &str = "/etc/systemd/system/ecnet-httpd.service";

fn cmd_install(cli: &Cli) -> ExitCode {
    let exe = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("cannot resolve executable path: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let unit = format!(
        "[Unit]\nDescription=ecnet static-file web server\nAfter=network.target\n\n\
         [Service]\nType=simple\nExecStart={} -start --root {} --port {} --pidfile {}\nRestart=on-failure\n\n\
         [Install]\nWantedBy=multi-user.target\n",
        exe.display(),
        cli.root.display(),
        cli.port,
        cli.pidfile.display()
    );
    match std::fs::write(UNIT_PATH, unit) {
        Ok(()) => {
            println!("installed {}", UNIT_PATH);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("install failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_uninstall(_cli: &Cli) -> ExitCode {
    match std::fs::remove_file(UNIT_PATH) {
        Ok(()) => {
            println!("removed {}", UNIT_PATH);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("uninstall failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_start(cli: &Cli) -> ExitCode {
    if let Some(pid) = read_pid(cli) {
        if pid_alive(pid) {
            eprintln!("ecnet-httpd is already running (pid {})", pid);
            return ExitCode::FAILURE;
        }
    }

    if cli.daemon {
        return spawn_detached(cli);
    }

    if let Err(e) = write_pidfile(cli) {
        log::warn!("pidfile {} not written: {}", cli.pidfile.display(), e);
    }
    install_sigterm();

    let rc = match serve(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("server failed: {}", e);
            ExitCode::FAILURE
        }
    };
    let _ = std::fs::remove_file(&cli.pidfile);
    rc
}

fn write_pidfile(cli: &Cli) -> std::io::Result<()> {
    let mut f = std::fs::File::create(&cli.pidfile)?;
    writeln!(f, "{}", std::process::id())
}

fn spawn_detached(cli: &Cli) -> ExitCode {
    let exe = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("cannot resolve executable path: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("-start")
        .arg("--root")
        .arg(&cli.root)
        .arg("--port")
        .arg(cli.port.to_string())
        .arg("--pidfile")
        .arg(&cli.pidfile)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let (Some(cert), Some(key)) = (&cli.cert, &cli.key) {
        cmd.arg("--cert").arg(cert).arg("--key").arg(key);
    }
    if let Some(auth) = &cli.auth {
        cmd.arg("--auth").arg(auth);
    }
    if let Some(bind) = &cli.bind {
        cmd.arg("--bind").arg(bind.to_string());
    }
    if let Some(port) = cli.ucp_port {
        cmd.arg("--ucp-port").arg(port.to_string());
    }
    match cmd.spawn() {
        Ok(child) => {
            println!("started ecnet-httpd (pid {})", child.id());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to start: {}", e);
            ExitCode::FAILURE
        }
    }
}

extern "C" fn on_sigterm(_sig: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn install_sigterm() {
    // SAFETY: handler only touches an atomic flag.
    unsafe {
        libc::signal(libc::SIGTERM, on_sigterm as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_sigterm as libc::sighandler_t);
    }
}

// ---------------------------------------------------------------------------
// The server loop
// ---------------------------------------------------------------------------

fn serve(cli: &Cli) -> ecnet::Result<()> {
    let http_cfg = HttpConfig {
        doc_root: cli.root.clone(),
        basic_auth: cli.auth.clone(),
        ..Default::default()
    };
    let mut srv = HttpServer::new(ServerConfig::default(), http_cfg)?;

    if let (Some(cert), Some(key)) = (&cli.cert, &cli.key) {
        srv.init_ca(cert, cli.ca_root.as_deref(), key)?;
        log::info!("[HTTPD] TLS credentials loaded from {}", cert.display());
    }

    srv.listen(cli.port, cli.bind, false)?;
    log::info!(
        "[HTTPD] serving {} on port {}",
        cli.root.display(),
        cli.port
    );

    let mut ucp = UcpEndpoint::new(UcpConfig::default());
    if let Some(port) = cli.ucp_port {
        srv.server().udp_listen(port, cli.bind, false)?;
        log::info!("[HTTPD] UCP echo endpoint on udp port {}", port);
    }
    let epoch = Instant::now();

    while !STOP.load(Ordering::Relaxed) {
        let now_ms = epoch.elapsed().as_millis() as i64;
        for event in srv.runtime(Duration::from_millis(100)) {
            match event {
                ServerEvent::Ws {
                    key,
                    opcode,
                    payload,
                } => {
                    // Echo service for WebSocket peers.
                    if srv.server().send_ws(key, opcode, &payload).is_err() {
                        srv.server().close_key(key);
                    }
                }
                ServerEvent::Data { key, .. } => {
                    // Raw TCP peers get no application protocol here.
                    srv.server().close_key(key);
                }
                ServerEvent::UdpFrame { key, from, data } => {
                    ucp.on_frame(key, from, &data, srv.server().poller_mut(), now_ms);
                }
                ServerEvent::Accepted { key, peer_ip, .. } => {
                    log::debug!("[HTTPD] ucid({}) accepted from {}", key, peer_ip);
                }
                ServerEvent::Disconnected { key, reason } => {
                    log::debug!("[HTTPD] ucid({}) gone: {:?}", key, reason);
                }
                _ => {}
            }
        }
        if cli.ucp_port.is_some() {
            ucp.runtime(now_ms, srv.server().poller_mut());
            for ev in ucp.poll_events() {
                match ev {
                    UcpEvent::Data { ssid, data } => {
                        let _ = ucp.send(ssid, &data, srv.server().poller_mut(), now_ms);
                    }
                    UcpEvent::Connected { ssid, .. } => {
                        log::info!("[HTTPD] ucp ssid({:08X}) connected", ssid);
                    }
                    UcpEvent::Disconnected { ssid, reason } => {
                        log::info!("[HTTPD] ucp ssid({:08X}) gone: {:?}", ssid, reason);
                    }
                }
            }
        }
    }
    log::info!("[HTTPD] shutting down");
    Ok(())
}
