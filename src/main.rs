//! The `volufs` command-line tool: mkfs, mount, umount, stat, check.

use std::io::Write as _;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;

use log::{info, warn, LevelFilter, Metadata, Record};
use zerocopy::{AsBytes, FromBytes};

use volufs::codec::codec_by_name;
use volufs::error::Error;
use volufs::fs::Fsys;
use volufs::pstor::Pstor;
use volufs::server::proto::{self, Opcode, PIoctl, RStatfs, ReqHead, IOCTL_HALT};
use volufs::server::Server;
use volufs::volume::Volume;

/// Exit codes of every subcommand.
const EXIT_USAGE: i32 = 1;
const EXIT_IO: i32 = 2;
const EXIT_CORRUPT: i32 = 3;
const EXIT_LOCKED: i32 = 4;

/// Socket name bound next to the mountpoint for the adaptor stream.
const SOCK_NAME: &str = ".volufs.sock";

/// Minimal stderr sink behind the `log` facade; the trace level is
/// runtime-adjustable through the pseudo file `logger/debug`.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("volufs: {}: {}", record.level().as_str().to_lowercase(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Parsed command line.
#[derive(Default)]
struct CmdArgs {
    prog: String,
    cmd: String,
    size: Option<u64>,
    cipher: String,
    passphrase_file: Option<PathBuf>,
    help: bool,
    positional: Vec<String>,
}

fn parse_args() -> CmdArgs {
    let mut args: CmdArgs = Default::default();
    args.cipher = "none".to_owned();
    let mut iter = std::env::args();
    args.prog = iter.next().unwrap_or_else(|| "volufs".to_owned());
    args.cmd = iter.next().unwrap_or_default();

    for arg in iter {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            _ if arg.starts_with("--size=") => {
                args.size = parse_size(&arg["--size=".len()..]);
                if args.size.is_none() {
                    usage_error(&args.prog, "bad --size value");
                }
            }
            _ if arg.starts_with("--cipher=") => {
                args.cipher = arg["--cipher=".len()..].to_owned();
            }
            _ if arg.starts_with("--passphrase-file=") => {
                args.passphrase_file =
                    Some(PathBuf::from(&arg["--passphrase-file=".len()..]));
            }
            _ if arg.starts_with("--") => {
                usage_error(&args.prog, &format!("unknown option `{}`", arg));
            }
            _ => args.positional.push(arg),
        }
    }
    args
}

/// Accepts byte counts with an optional K/M/G/T suffix.
fn parse_size(text: &str) -> Option<u64> {
    let (digits, mul) = match text.char_indices().last()? {
        (i, 'K') => (&text[..i], 1u64 << 10),
        (i, 'M') => (&text[..i], 1 << 20),
        (i, 'G') => (&text[..i], 1 << 30),
        (i, 'T') => (&text[..i], 1 << 40),
        _ => (text, 1),
    };
    digits.parse::<u64>().ok().map(|n| n * mul)
}

fn usage(prog: &str) {
    eprintln!("usage: {} mkfs <volume> --size=N[KMGT]", prog);
    eprintln!("       {} mount <volume> <mntpoint> [--cipher=aes|none] [--passphrase-file=P]", prog);
    eprintln!("       {} umount <mntpoint>", prog);
    eprintln!("       {} stat <mntpoint>", prog);
    eprintln!("       {} check <volume>", prog);
}

fn usage_error(prog: &str, msg: &str) -> ! {
    eprintln!("{}: {}", prog, msg);
    usage(prog);
    exit(EXIT_USAGE)
}

fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::Busy => EXIT_LOCKED,
        Error::BadMagic | Error::CorruptData(_) | Error::WrongKind(_) => EXIT_CORRUPT,
        Error::Invalid => EXIT_USAGE,
        _ => EXIT_IO,
    }
}

fn fail(prog: &str, err: &Error) -> ! {
    eprintln!("{}: {}", prog, err);
    exit(exit_code_for(err))
}

fn sock_path(mntpoint: &Path) -> PathBuf {
    mntpoint.join(SOCK_NAME)
}

fn env_or(args: &[String], index: usize, var: &str) -> Option<String> {
    args.get(index).cloned().or_else(|| std::env::var(var).ok())
}

fn cmd_mkfs(args: &CmdArgs) {
    let volume = env_or(&args.positional, 0, "FS_VOLUME")
        .unwrap_or_else(|| usage_error(&args.prog, "mkfs needs a volume path"));
    let size = args
        .size
        .unwrap_or_else(|| usage_error(&args.prog, "mkfs needs --size"));
    let codec = codec_by_name(&args.cipher).unwrap_or_else(|err| fail(&args.prog, &err));
    match volufs::mkfs::mkfs(Path::new(&volume), size, codec) {
        Ok(uuid) => println!("{}: created volume {}, uuid {}", args.prog, volume, uuid),
        Err(err) => fail(&args.prog, &err),
    }
}

fn cmd_mount(args: &CmdArgs) {
    let volume = env_or(&args.positional, 0, "FS_VOLUME")
        .unwrap_or_else(|| usage_error(&args.prog, "mount needs a volume path"));
    let mntpoint = env_or(&args.positional, 1, "FS_MOUNTPOINT")
        .unwrap_or_else(|| usage_error(&args.prog, "mount needs a mountpoint"));
    if args.passphrase_file.is_some() && args.cipher == "none" {
        usage_error(&args.prog, "--passphrase-file needs --cipher");
    }
    let codec = codec_by_name(&args.cipher).unwrap_or_else(|err| fail(&args.prog, &err));

    let vol = Volume::open(Path::new(&volume), codec).unwrap_or_else(|err| fail(&args.prog, &err));
    let cache_nbk = std::env::var("FS_CACHE_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .map(|bytes| (bytes / volufs::param::BK_SIZE).max(64))
        .unwrap_or(volufs::param::CACHE_NBK_DEFAULT);
    let cache = Arc::new(volufs::cache::Cache::new(cache_nbk));
    let pstor = Arc::new(Pstor::new(vol, cache));
    let fsys = Fsys::mount(pstor).unwrap_or_else(|err| fail(&args.prog, &err));

    let sock = sock_path(Path::new(&mntpoint));
    let _ = std::fs::remove_file(&sock);
    let listener = UnixListener::bind(&sock)
        .unwrap_or_else(|err| fail(&args.prog, &Error::Io(err)));
    info!("mounted {} at {}", volume, mntpoint);

    // One adaptor stream at a time; a halt write ends the loop through
    // the drain protocol.
    while fsys.is_active() {
        let (stream, _) = match listener.accept() {
            Ok(conn) => conn,
            Err(err) => {
                warn!("accept failed: {}", err);
                break;
            }
        };
        let reader = match stream.try_clone() {
            Ok(r) => r,
            Err(err) => {
                warn!("stream clone failed: {}", err);
                continue;
            }
        };
        let server = Server::new(fsys.clone(), Server::nsio_from_env());
        if let Err(err) = server.serve(reader, stream) {
            warn!("session ended with error: {}", err);
        }
    }
    let _ = std::fs::remove_file(&sock);
    if let Err(err) = fsys.unmount() {
        fail(&args.prog, &err);
    }
    info!("unmounted {}", mntpoint);
}

/// Sends one request over the control socket and returns the reply
/// payload, failing on a non-zero errno.
fn roundtrip(
    prog: &str,
    stream: &mut UnixStream,
    opcode: Opcode,
    ino: u64,
    payload: &[u8],
) -> Vec<u8> {
    let head = ReqHead {
        opcode: opcode as u32,
        pad0: 0,
        unique: 1,
        ino,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        pid: std::process::id(),
        pad1: 0,
    };
    let mut w = stream.try_clone().unwrap_or_else(|err| fail(prog, &Error::Io(err)));
    proto::write_request(&mut w, &head, payload).unwrap_or_else(|err| fail(prog, &err));
    let (resp, data) = proto::read_response(stream).unwrap_or_else(|err| fail(prog, &err));
    if resp.error != 0 {
        let err = std::io::Error::from_raw_os_error(-resp.error);
        eprintln!("{}: {}", prog, err);
        exit(if -resp.error == libc::EBUSY { EXIT_LOCKED } else { EXIT_IO });
    }
    data
}

fn connect(prog: &str, mntpoint: &str) -> UnixStream {
    UnixStream::connect(sock_path(Path::new(mntpoint))).unwrap_or_else(|err| {
        eprintln!("{}: {}: {}", prog, mntpoint, err);
        exit(EXIT_IO)
    })
}

fn cmd_umount(args: &CmdArgs) {
    let mntpoint = env_or(&args.positional, 0, "FS_MOUNTPOINT")
        .unwrap_or_else(|| usage_error(&args.prog, "umount needs a mountpoint"));
    let mut stream = connect(&args.prog, &mntpoint);
    let p = PIoctl { cmd: IOCTL_HALT, arg: 0 };
    let _ = roundtrip(&args.prog, &mut stream, Opcode::Ioctl, 1, p.as_bytes());
    println!("{}: {} unmounting", args.prog, mntpoint);
}

fn cmd_stat(args: &CmdArgs) {
    let mntpoint = env_or(&args.positional, 0, "FS_MOUNTPOINT")
        .unwrap_or_else(|| usage_error(&args.prog, "stat needs a mountpoint"));
    let mut stream = connect(&args.prog, &mntpoint);
    let data = roundtrip(&args.prog, &mut stream, Opcode::Statfs, 1, &[]);
    let st = RStatfs::read_from_prefix(&data[..]).unwrap_or_else(|| {
        eprintln!("{}: short statfs reply", args.prog);
        exit(EXIT_IO)
    });
    println!("block-size:   {}", st.bk_size);
    println!("blocks-total: {}", st.nbk_total);
    println!("blocks-free:  {}", st.nbk_free);
    println!("files-total:  {}", st.nfiles_total);
    println!("files-free:   {}", st.nfiles_free);
    println!("name-max:     {}", st.name_max);
}

fn cmd_check(args: &CmdArgs) {
    let volume = env_or(&args.positional, 0, "FS_VOLUME")
        .unwrap_or_else(|| usage_error(&args.prog, "check needs a volume path"));
    let codec = codec_by_name(&args.cipher).unwrap_or_else(|err| fail(&args.prog, &err));
    match volufs::check::check_volume(Path::new(&volume), codec) {
        Ok(report) if report.is_clean() => {
            println!(
                "{}: {} clean, {} nodes, {} inodes",
                args.prog, volume, report.nodes_checked, report.inodes
            );
        }
        Ok(report) => {
            let mut err_out = std::io::stderr();
            for msg in &report.errors {
                let _ = writeln!(err_out, "{}: {}", args.prog, msg);
            }
            exit(EXIT_CORRUPT);
        }
        Err(err) => fail(&args.prog, &err),
    }
}

fn init_logging() {
    let level = match std::env::var("FS_LOG_LEVEL").ok().as_deref() {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn main() {
    init_logging();
    let args = parse_args();
    if args.help || args.cmd.is_empty() {
        usage(&args.prog);
        exit(if args.help { 0 } else { EXIT_USAGE });
    }
    match args.cmd.as_str() {
        "mkfs" => cmd_mkfs(&args),
        "mount" => cmd_mount(&args),
        "umount" => cmd_umount(&args),
        "stat" => cmd_stat(&args),
        "check" => cmd_check(&args),
        other => usage_error(&args.prog, &format!("unknown command `{}`", other)),
    }
}
