//! Manual-testing convenience binary: creates a Linux
//! TUN device the same way the reference crate's `LinuxTunDevice` does
//! (`ioctl(TUNSETIFF)` plus `ip addr`/`ip link` to bring it up), wires
//! the resulting file descriptor into [`sinkhole_core::Engine`], and
//! prints packet-log records to stdout until interrupted. Not part of
//! the engine's tested surface — it exists so a developer can point a
//! real TUN device at the engine without writing a host app first.

use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::process::Command;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use sinkhole_core::{Engine, EngineConfig, HostCallbacks, LogLevel, PacketRecord};

#[derive(Parser, Debug)]
#[command(name = "sinkhole-demo", about = "Manual TUN-backed test harness for sinkhole-core")]
struct Args {
    /// TUN interface name to create.
    #[arg(long, default_value = "tun-sinkhole")]
    iface: String,

    /// Address assigned to the TUN interface.
    #[arg(long, default_value = "10.0.0.1")]
    address: Ipv4Addr,

    /// Netmask prefix length for the TUN interface.
    #[arg(long, default_value_t = 24)]
    prefix: u8,

    /// Optional hosts-style blocklist file (see `hosts.rs`).
    #[arg(long)]
    hosts: Option<std::path::PathBuf>,

    /// Optional PCAP capture file.
    #[arg(long)]
    pcap: Option<std::path::PathBuf>,

    /// Disable owner-based filtering (allow every flow).
    #[arg(long)]
    no_filter: bool,
}

const IFNAMSIZ: usize = 16;
const TUNSETIFF: libc::c_ulong = 0x4004_54CA;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 24 - std::mem::size_of::<libc::c_short>()],
}

fn open_tun(name: &str) -> Result<RawFd> {
    if name.len() >= IFNAMSIZ {
        bail!("tun interface name too long: {name}");
    }
    let fd = unsafe {
        libc::open(
            b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
            libc::O_RDWR,
        )
    };
    if fd < 0 {
        bail!("open(/dev/net/tun) failed: {}", std::io::Error::last_os_error());
    }

    let mut ifr = IfReq {
        ifr_name: [0u8; IFNAMSIZ],
        ifr_flags: IFF_TUN | IFF_NO_PI,
        _padding: [0u8; 24 - std::mem::size_of::<libc::c_short>()],
    };
    ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

    let ret = unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr as *mut IfReq as *mut c_void) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        bail!("ioctl(TUNSETIFF) failed: {err}");
    }
    Ok(fd)
}

fn run_ip(args: &[&str]) -> Result<()> {
    let status = Command::new("ip")
        .args(args)
        .status()
        .with_context(|| format!("failed to run: ip {}", args.join(" ")))?;
    if !status.success() {
        bail!("ip {} exited with {status}", args.join(" "));
    }
    Ok(())
}

fn configure_tun(name: &str, address: Ipv4Addr, prefix: u8) -> Result<()> {
    run_ip(&["addr", "replace", &format!("{address}/{prefix}"), "dev", name])?;
    run_ip(&["link", "set", "dev", name, "up"])?;
    Ok(())
}

/// Callback implementation for this demo: no real VPN to protect
/// sockets from, so `protect` is a no-op success; packet records are
/// printed; worker exit is reported and used to unblock `main`.
struct DemoCallbacks {
    exited: std::sync::Mutex<Option<Option<String>>>,
    exited_cv: std::sync::Condvar,
}

impl DemoCallbacks {
    fn new() -> Self {
        DemoCallbacks {
            exited: std::sync::Mutex::new(None),
            exited_cv: std::sync::Condvar::new(),
        }
    }

    fn wait_for_exit(&self) -> Option<String> {
        let mut guard = self.exited.lock().unwrap();
        while guard.is_none() {
            guard = self.exited_cv.wait(guard).unwrap();
        }
        guard.take().unwrap()
    }
}

impl HostCallbacks for DemoCallbacks {
    fn protect(&self, _socket: RawFd) -> bool {
        true
    }

    fn log_packet(&self, record: PacketRecord) {
        println!(
            "[{:>6}ms] v{} proto={:<3} {}:{} -> {}:{} flags={:<5} owner={:?} allowed={} {}",
            record.time_ms,
            record.version,
            record.protocol,
            record.source,
            record.source_port,
            record.dest,
            record.dest_port,
            record.flags,
            record.owner,
            record.allowed,
            record.extra,
        );
    }

    fn native_exit(&self, reason: Option<&str>) {
        *self.exited.lock().unwrap() = Some(reason.map(str::to_string));
        self.exited_cv.notify_all();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let tun_fd = open_tun(&args.iface)?;
    configure_tun(&args.iface, args.address, args.prefix)?;

    let config = EngineConfig {
        tun_fd,
        allowed_owners: Vec::new(),
        hosts_path: args.hosts,
        log: true,
        filter: !args.no_filter,
        debug: false,
        log_level: LogLevel::Info,
    };

    let callbacks = Arc::new(DemoCallbacks::new());
    let engine = Engine::new(config, callbacks.clone())?;
    if let Some(path) = &args.pcap {
        engine.set_pcap(Some(path))?;
    }

    engine.start()?;
    println!("sinkhole-demo running on {} ({}/{}). Ctrl-C to stop.", args.iface, args.address, args.prefix);

    ctrlc_stop(&engine);

    let reason = callbacks.wait_for_exit();
    if let Some(reason) = reason {
        eprintln!("worker exited: {reason}");
    }
    unsafe {
        libc::close(tun_fd);
    }
    Ok(())
}

/// Installs a SIGINT handler that stops the engine, so Ctrl-C performs a
/// clean shutdown instead of killing the process mid-teardown.
fn ctrlc_stop(engine: &Engine) {
    static mut ENGINE_PTR: *const Engine = std::ptr::null();
    unsafe {
        ENGINE_PTR = engine as *const Engine;

        extern "C" fn handler(_signum: libc::c_int) {
            unsafe {
                if let Some(engine) = ENGINE_PTR.as_ref() {
                    engine.stop();
                }
            }
        }

        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
    }
}
