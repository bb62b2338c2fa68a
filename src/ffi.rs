//! C-ABI surface mirroring the enclave entry points the untrusted host
//! calls. One process-wide session slot; all functions return 0 on success
//! and 1 on failure, except `soe_get_tuple` where 1 means end-of-scan.
//!
//! Storage goes through the file-backed host rooted at the directory set
//! with [`soe_set_storage_dir`] (default: the working directory).

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint};
use std::path::PathBuf;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::common::Oid;
use crate::host::FileHost;
use crate::session::{Session, SessionOptions, HALT_KEY, MAX_TUPLE_SIZE};

static SESSION: Lazy<Mutex<Option<Session>>> = Lazy::new(|| Mutex::new(None));
static STORAGE_DIR: Lazy<Mutex<PathBuf>> = Lazy::new(|| Mutex::new(PathBuf::from(".")));

/// FFI tuple header: `(block, offnum, t_len, table_oid)`.
pub const TUPLE_HEADER_LEN: usize = 16;

fn cstr<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

/// # Safety
/// `path` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn soe_set_storage_dir(path: *const c_char) -> c_int {
    match cstr(path) {
        Some(p) => {
            *STORAGE_DIR.lock() = PathBuf::from(p);
            0
        }
        None => 1,
    }
}

/// # Safety
/// String arguments must be valid NUL-terminated strings; `attr_desc` must
/// point to `attr_desc_len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn soe_init(
    table_name: *const c_char,
    index_name: *const c_char,
    table_nblocks: c_uint,
    index_nblocks: c_uint,
    table_oid: c_uint,
    index_oid: c_uint,
    function_oid: c_uint,
    index_handler: c_uint,
    attr_desc: *const u8,
    attr_desc_len: c_uint,
) -> c_int {
    let (Some(table), Some(index)) = (cstr(table_name), cstr(index_name)) else {
        return 1;
    };
    if attr_desc.is_null() {
        return 1;
    }
    let attrs = std::slice::from_raw_parts(attr_desc, attr_desc_len as usize);
    let host = FileHost::new(STORAGE_DIR.lock().clone());

    match Session::init_soe(
        host,
        table,
        index,
        table_nblocks,
        index_nblocks,
        table_oid as Oid,
        index_oid as Oid,
        function_oid as Oid,
        index_handler as Oid,
        attrs,
        SessionOptions::default(),
    ) {
        Ok(session) => {
            *SESSION.lock() = Some(session);
            0
        }
        Err(e) => {
            tracing::warn!(error = %e, "soe_init failed");
            1
        }
    }
}

/// # Safety
/// As for [`soe_init`]; `fanouts` must point to `nlevels` readable ints.
#[no_mangle]
pub unsafe extern "C" fn soe_init_fsoe(
    table_name: *const c_char,
    index_name: *const c_char,
    table_nblocks: c_uint,
    fanouts: *const c_uint,
    nlevels: c_uint,
    table_oid: c_uint,
    index_oid: c_uint,
    attr_desc: *const u8,
    attr_desc_len: c_uint,
) -> c_int {
    let (Some(table), Some(index)) = (cstr(table_name), cstr(index_name)) else {
        return 1;
    };
    if attr_desc.is_null() || fanouts.is_null() {
        return 1;
    }
    let attrs = std::slice::from_raw_parts(attr_desc, attr_desc_len as usize);
    let fanouts = std::slice::from_raw_parts(fanouts, nlevels as usize).to_vec();
    let host = FileHost::new(STORAGE_DIR.lock().clone());

    match Session::init_fsoe(
        host,
        table,
        index,
        table_nblocks,
        fanouts,
        table_oid as Oid,
        index_oid as Oid,
        attrs,
        SessionOptions {
            dummies: true,
            ..SessionOptions::default()
        },
    ) {
        Ok(session) => {
            *SESSION.lock() = Some(session);
            0
        }
        Err(e) => {
            tracing::warn!(error = %e, "soe_init_fsoe failed");
            1
        }
    }
}

/// # Safety
/// `heap_tuple` and `datum` must point to the given number of readable
/// bytes.
#[no_mangle]
pub unsafe extern "C" fn soe_insert(
    heap_tuple: *const u8,
    tuple_size: c_uint,
    datum: *const u8,
    datum_size: c_uint,
) -> c_int {
    if heap_tuple.is_null() || datum.is_null() {
        return 1;
    }
    let tuple = std::slice::from_raw_parts(heap_tuple, tuple_size as usize);
    let datum = std::slice::from_raw_parts(datum, datum_size as usize);
    with_session(|session| session.insert(tuple, datum))
}

/// # Safety
/// `heap_tuple` must point to `tuple_size` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn soe_insert_heap(heap_tuple: *const u8, tuple_size: c_uint) -> c_int {
    if heap_tuple.is_null() {
        return 1;
    }
    let tuple = std::slice::from_raw_parts(heap_tuple, tuple_size as usize);
    with_session(|session| session.insert_heap(tuple))
}

/// # Safety
/// `block` must point to `block_size` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn soe_add_heap_block(
    block: *const u8,
    block_size: c_uint,
    blkno: c_uint,
) -> c_int {
    if block.is_null() {
        return 1;
    }
    let block = std::slice::from_raw_parts(block, block_size as usize);
    with_session(|session| session.add_heap_block(block, blkno))
}

/// # Safety
/// `block` must point to `block_size` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn soe_add_index_block(
    block: *const u8,
    block_size: c_uint,
    offset: c_uint,
    level: c_uint,
) -> c_int {
    if block.is_null() {
        return 1;
    }
    let block = std::slice::from_raw_parts(block, block_size as usize);
    with_session(|session| session.add_index_block(block, offset, level))
}

/// Returns 0 when a tuple was copied out, 1 at end-of-scan or on error.
///
/// # Safety
/// `key` must point to `key_size` readable bytes; `tuple_header` and
/// `tuple_data` must point to writable buffers of the given lengths.
#[no_mangle]
pub unsafe extern "C" fn soe_get_tuple(
    _opmode: c_uint,
    opoid: c_uint,
    key: *const c_char,
    key_size: c_int,
    tuple_header: *mut u8,
    tuple_header_len: c_uint,
    tuple_data: *mut u8,
    tuple_data_len: c_uint,
) -> c_int {
    if key.is_null() || tuple_header.is_null() || tuple_data.is_null() {
        return 1;
    }
    if (tuple_header_len as usize) < TUPLE_HEADER_LEN {
        return 1;
    }
    let key = std::slice::from_raw_parts(key as *const u8, key_size as usize);
    let key: &[u8] = if key.ends_with(&[0]) {
        &key[..key.len() - 1]
    } else {
        key
    };

    let mut guard = SESSION.lock();
    let Some(session) = guard.as_mut() else {
        return 1;
    };

    let halt = key == HALT_KEY;
    match session.get_tuple(opoid as Oid, key) {
        Ok(Some(tuple)) if !halt => {
            let data = &tuple.t_data;
            if data.len() > MAX_TUPLE_SIZE || data.len() > tuple_data_len as usize {
                tracing::warn!(len = data.len(), "tuple exceeds output buffer");
                return 1;
            }
            let header = std::slice::from_raw_parts_mut(tuple_header, TUPLE_HEADER_LEN);
            header[0..4].copy_from_slice(&tuple.t_self.block.to_le_bytes());
            header[4..6].copy_from_slice(&tuple.t_self.offnum.to_le_bytes());
            header[6..8].fill(0);
            header[8..12].copy_from_slice(&(tuple.t_len as u32).to_le_bytes());
            header[12..16].copy_from_slice(&tuple.t_table_oid.to_le_bytes());
            std::slice::from_raw_parts_mut(tuple_data, data.len()).copy_from_slice(data);
            0
        }
        Ok(_) => 1,
        Err(e) => {
            tracing::warn!(error = %e, "soe_get_tuple failed");
            1
        }
    }
}

#[no_mangle]
pub extern "C" fn soe_close() -> c_int {
    match SESSION.lock().take() {
        Some(session) => match session.close() {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "soe_close failed");
                1
            }
        },
        None => 1,
    }
}

fn with_session(f: impl FnOnce(&mut Session) -> crate::error::Result<()>) -> c_int {
    let mut guard = SESSION.lock();
    match guard.as_mut() {
        Some(session) => match f(session) {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "session operation failed");
                1
            }
        },
        None => 1,
    }
}
