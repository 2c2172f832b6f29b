//! End-to-end pipeline: frames in, replies out, drain on halt.

mod common;

use std::os::unix::net::UnixStream;

use common::randbuf;
use volufs::server::proto::*;
use volufs::server::Server;
use zerocopy::{AsBytes, FromBytes};

struct Client {
    stream: UnixStream,
    unique: u64,
}

impl Client {
    fn call(&mut self, opcode: Opcode, ino: u64, payload: &[u8]) -> (RespHead, Vec<u8>) {
        self.unique += 1;
        let head = ReqHead {
            opcode: opcode as u32,
            pad0: 0,
            unique: self.unique,
            ino,
            uid: 0,
            gid: 0,
            pid: 1,
            pad1: 0,
        };
        let mut w = self.stream.try_clone().unwrap();
        write_request(&mut w, &head, payload).unwrap();
        let (resp, data) = read_response(&mut self.stream).unwrap();
        assert_eq!(resp.unique, self.unique);
        (resp, data)
    }

    fn ok(&mut self, opcode: Opcode, ino: u64, payload: &[u8]) -> Vec<u8> {
        let (resp, data) = self.call(opcode, ino, payload);
        assert_eq!(resp.error, 0, "opcode {:?} failed: errno {}", opcode, -resp.error);
        data
    }
}

fn serve_env() -> (common::FsEnv, Client, std::thread::JoinHandle<()>) {
    let env = common::FsEnv::new();
    let fsys = env.fs().clone();
    let (client_side, server_side) = UnixStream::pair().unwrap();
    let handle = std::thread::spawn(move || {
        let server = Server::new(fsys, 4);
        let reader = server_side.try_clone().unwrap();
        server.serve(reader, server_side).unwrap();
    });
    (env, Client { stream: client_side, unique: 0 }, handle)
}

fn finish(mut client: Client, handle: std::thread::JoinHandle<()>) {
    // Halt, then close the stream so RX observes end-of-input.
    let p = PIoctl { cmd: IOCTL_HALT, arg: 0 };
    let _ = client.ok(Opcode::Ioctl, 1, p.as_bytes());
    let _ = client.stream.shutdown(std::net::Shutdown::Both);
    handle.join().unwrap();
}

#[test]
fn lookup_create_write_read() {
    let (env, mut client, handle) = serve_env();
    let root = env.root();

    let (resp, _) = client.call(Opcode::Lookup, root, b"nofile");
    assert_eq!(resp.error, -libc::ENOENT);

    let mut payload = PCreate { mode: 0o644, flags: 0 }.as_bytes().to_vec();
    payload.extend_from_slice(b"hello.txt");
    let data = client.ok(Opcode::Create, root, &payload);
    let created = RCreate::read_from_prefix(&data[..]).unwrap();
    let ino = created.attr.ino;
    let fh = created.fh;

    let body = randbuf(100_000, 5);
    let mut payload = PWrite { fh, off: 0, len: body.len() as u32, pad0: 0 }
        .as_bytes()
        .to_vec();
    payload.extend_from_slice(&body);
    let data = client.ok(Opcode::Write, ino, &payload);
    let written = RWrite::read_from_prefix(&data[..]).unwrap();
    assert_eq!(written.count as usize, body.len());

    let p = PRead { fh, off: 0, len: body.len() as u32, pad0: 0 };
    let data = client.ok(Opcode::Read, ino, p.as_bytes());
    assert_eq!(data, body);

    let entry = client.ok(Opcode::Lookup, root, b"hello.txt");
    let attr = RAttr::read_from_prefix(&entry[..]).unwrap();
    assert_eq!(attr.ino, ino);
    assert_eq!(attr.size, body.len() as u64);

    let p = PFsync { fh, datasync: 0, pad0: 0 };
    let _ = client.ok(Opcode::Fsync, ino, p.as_bytes());

    let p = PRelease { fh };
    let _ = client.ok(Opcode::Release, ino, p.as_bytes());

    finish(client, handle);
}

#[test]
fn statfs_over_the_wire() {
    let (env, mut client, handle) = serve_env();
    let data = client.ok(Opcode::Statfs, 1, &[]);
    let st = RStatfs::read_from_prefix(&data[..]).unwrap();
    let direct = env.statfs();
    assert_eq!(st.nbk_total, direct.nbk_total);
    assert_eq!(st.bk_size, direct.bk_size);
    finish(client, handle);
}

#[test]
fn mkdir_readdir_over_the_wire() {
    let (env, mut client, handle) = serve_env();
    let root = env.root();

    let mut payload = PMkdir { mode: 0o755, pad0: 0 }.as_bytes().to_vec();
    payload.extend_from_slice(b"subdir");
    let data = client.ok(Opcode::Mkdir, root, &payload);
    let attr = RAttr::read_from_prefix(&data[..]).unwrap();
    assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFDIR);

    let p = PReaddir { fh: 0, cursor: 0, limit: 64, pad0: 0 };
    let data = client.ok(Opcode::Readdir, root, p.as_bytes());
    // Walk the packed dirent records for the new entry.
    let mut found = false;
    let mut off = 0usize;
    while off + RDIRENT_SIZE <= data.len() {
        let hdr = RDirent::read_from_prefix(&data[off..]).unwrap();
        let name_start = off + RDIRENT_SIZE;
        let name = &data[name_start..name_start + hdr.nlen as usize];
        if name == b"subdir" {
            assert_eq!(hdr.ino, attr.ino);
            assert_eq!(hdr.dtype, libc::DT_DIR);
            found = true;
        }
        off = name_start + ((hdr.nlen as usize + 7) & !7);
    }
    assert!(found, "readdir missed the new directory");
    finish(client, handle);
}

#[test]
fn flock_is_unsupported() {
    let (_env, mut client, handle) = serve_env();
    let (resp, _) = client.call(Opcode::Flock, 1, &[]);
    assert_eq!(resp.error, -libc::ENOSYS);
    finish(client, handle);
}

#[test]
fn eof_without_halt_drains() {
    let (env, client, handle) = serve_env();
    drop(client);
    handle.join().unwrap();
    // The server survived the vanished adaptor; the context unmounts.
    assert!(env.fs().is_active());
}

#[test]
fn pipelined_misses_resolve() {
    // Force cold reads through the storage stage: populate, remount,
    // then read everything back over the wire.
    let mut env = common::FsEnv::new();
    let root = env.root();
    let (ino, fh) = env.create(root, "cold");
    let body = randbuf(256 * 1024, 9);
    env.write_read(ino, &body, 0);
    env.release(fh);
    env.reload();

    let fsys = env.fs().clone();
    let (client_side, server_side) = UnixStream::pair().unwrap();
    let handle = std::thread::spawn(move || {
        let server = Server::new(fsys, 2);
        let reader = server_side.try_clone().unwrap();
        server.serve(reader, server_side).unwrap();
    });
    let mut client = Client { stream: client_side, unique: 0 };

    let root = env.root();
    let entry = client.ok(Opcode::Lookup, root, b"cold");
    let attr = RAttr::read_from_prefix(&entry[..]).unwrap();
    assert_eq!(attr.size, body.len() as u64);

    let p = POpen { flags: 0, pad0: 0 };
    let data = client.ok(Opcode::Open, attr.ino, p.as_bytes());
    let opened = ROpen::read_from_prefix(&data[..]).unwrap();

    let p = PRead { fh: opened.fh, off: 0, len: body.len() as u32, pad0: 0 };
    let data = client.ok(Opcode::Read, attr.ino, p.as_bytes());
    assert_eq!(data, body);

    let p = PRelease { fh: opened.fh };
    let _ = client.ok(Opcode::Release, attr.ino, p.as_bytes());
    finish(client, handle);
}

#[test]
fn halt_write_through_pseudo_file() {
    let (env, mut client, handle) = serve_env();
    let root = env.root();
    let entry = client.ok(Opcode::Lookup, root, b".volufs");
    let proot = RAttr::read_from_prefix(&entry[..]).unwrap().ino;
    let entry = client.ok(Opcode::Lookup, proot, b"halt");
    let halt = RAttr::read_from_prefix(&entry[..]).unwrap().ino;

    let p = POpen { flags: libc::O_WRONLY as u32, pad0: 0 };
    let data = client.ok(Opcode::Open, halt, p.as_bytes());
    let fh = ROpen::read_from_prefix(&data[..]).unwrap().fh;

    let mut payload = PWrite { fh, off: 0, len: 1, pad0: 0 }.as_bytes().to_vec();
    payload.extend_from_slice(b"0");
    let _ = client.ok(Opcode::Write, halt, &payload);
    let p = PRelease { fh };
    let _ = client.ok(Opcode::Release, halt, p.as_bytes());

    // Deactivated: the server drains once the stream closes.
    let _ = client.stream.shutdown(std::net::Shutdown::Both);
    handle.join().unwrap();
    assert!(!env.fs().is_active());
}
