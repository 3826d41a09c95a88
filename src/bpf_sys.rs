//! Minimal raw `bpf(2)` syscall bindings: just enough of the kernel uapi to
//! create maps, load a program built by [`crate::bytecode`], and attach it
//! to an interface via `BPF_LINK_CREATE`, without going through an
//! ELF-oriented loader (spec.md §9: "generate programmatically, no external
//! compiler"). Mirrors the style `socket.rs`/`device.rs` already use for
//! hand-rolled uapi structs rather than reaching for a netlink crate.

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

const SYS_BPF: i64 = 321; // x86_64; uapi syscall number is architecture-stable across the kernels this targets.

const BPF_MAP_CREATE: u32 = 0;
const BPF_MAP_UPDATE_ELEM: u32 = 2;
const BPF_PROG_LOAD: u32 = 5;
const BPF_OBJ_GET: u32 = 7;
const BPF_LINK_CREATE: u32 = 28;

const BPF_PROG_TYPE_XDP: u32 = 6;
const BPF_ATTACH_TYPE_XDP: u32 = 37;

pub const BPF_MAP_TYPE_HASH: u32 = 1;
pub const BPF_MAP_TYPE_XSKMAP: u32 = 17;

const BPF_OBJ_NAME_LEN: usize = 16;
const BPF_LOG_BUF_SIZE: usize = 16 * 1024;

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; BPF_OBJ_NAME_LEN],
    map_ifindex: u32,
    btf_fd: u32,
    btf_key_type_id: u32,
    btf_value_type_id: u32,
    btf_vmlinux_value_type_id: u32,
    map_extra: u64,
}

#[repr(C)]
#[derive(Default)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; BPF_OBJ_NAME_LEN],
    prog_ifindex: u32,
    expected_attach_type: u32,
}

#[repr(C)]
#[derive(Default)]
struct MapUpdateElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Default)]
struct ObjGetAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct LinkCreateAttr {
    prog_fd: u32,
    target_ifindex: u32,
    attach_type: u32,
    flags: u32,
}

unsafe fn bpf(cmd: u32, attr: *const u8, size: usize) -> io::Result<i64> {
    let ret = libc::syscall(SYS_BPF, cmd as libc::c_long, attr, size);
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn obj_name(name: &str) -> [u8; BPF_OBJ_NAME_LEN] {
    let mut buf = [0u8; BPF_OBJ_NAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(BPF_OBJ_NAME_LEN - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// create a map of `map_type` (see `BPF_MAP_TYPE_*`) with the given
/// key/value sizes and capacity.
pub fn create_map(name: &str, map_type: u32, key_size: u32, value_size: u32, max_entries: u32) -> io::Result<OwnedFd> {
    let attr = MapCreateAttr {
        map_type,
        key_size,
        value_size,
        max_entries,
        map_name: obj_name(name),
        ..Default::default()
    };
    let fd = unsafe { bpf(BPF_MAP_CREATE, &attr as *const _ as *const u8, std::mem::size_of::<MapCreateAttr>())? };
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

pub fn map_update_elem(map_fd: &OwnedFd, key: &[u8], value: &[u8]) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    let attr = MapUpdateElemAttr {
        map_fd: map_fd.as_raw_fd() as u32,
        key: key.as_ptr() as u64,
        value: value.as_ptr() as u64,
        flags: 0,
        ..Default::default()
    };
    unsafe { bpf(BPF_MAP_UPDATE_ELEM, &attr as *const _ as *const u8, std::mem::size_of::<MapUpdateElemAttr>())? };
    Ok(())
}

/// load an XDP program from its raw instruction stream, returning the
/// verifier log on rejection (spec.md §7 `VerifierRejection`).
pub fn load_xdp_prog(name: &str, insns: &[u8]) -> Result<OwnedFd, String> {
    let license = CString::new("GPL").expect("static license string has no interior NUL");
    let mut log_buf = vec![0u8; BPF_LOG_BUF_SIZE];
    let attr = ProgLoadAttr {
        prog_type: BPF_PROG_TYPE_XDP,
        insn_cnt: (insns.len() / 8) as u32,
        insns: insns.as_ptr() as u64,
        license: license.as_ptr() as u64,
        log_level: 1,
        log_size: log_buf.len() as u32,
        log_buf: log_buf.as_mut_ptr() as u64,
        prog_name: obj_name(name),
        ..Default::default()
    };
    match unsafe { bpf(BPF_PROG_LOAD, &attr as *const _ as *const u8, std::mem::size_of::<ProgLoadAttr>()) } {
        Ok(fd) => Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) }),
        Err(_) => {
            let end = log_buf.iter().position(|&b| b == 0).unwrap_or(0);
            Err(String::from_utf8_lossy(&log_buf[..end]).into_owned())
        }
    }
}

/// open an object (program or map) previously pinned under `/sys/fs/bpf/...`.
pub fn obj_get(pathname: &str) -> io::Result<OwnedFd> {
    let c_path = CString::new(pathname).map_err(|_| io::Error::other("pin path contains NUL"))?;
    let attr = ObjGetAttr { pathname: c_path.as_ptr() as u64, ..Default::default() };
    let fd = unsafe { bpf(BPF_OBJ_GET, &attr as *const _ as *const u8, std::mem::size_of::<ObjGetAttr>())? };
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

/// attach a loaded XDP program fd to an interface via `BPF_LINK_CREATE`,
/// returning the link fd (dropping it detaches the program).
pub fn attach_xdp_link(prog_fd: &OwnedFd, if_index: u32) -> io::Result<OwnedFd> {
    use std::os::fd::AsRawFd;
    let attr = LinkCreateAttr {
        prog_fd: prog_fd.as_raw_fd() as u32,
        target_ifindex: if_index,
        attach_type: BPF_ATTACH_TYPE_XDP,
        flags: 0,
    };
    let fd = unsafe { bpf(BPF_LINK_CREATE, &attr as *const _ as *const u8, std::mem::size_of::<LinkCreateAttr>())? };
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}
