// Batched datagram transmission.
// Linux issues one sendmmsg(2) per batch; other unix targets fall back to a
// send(2) per datagram.

use std::io;
use std::os::unix::io::RawFd;

/// Transmit every datagram in `datagrams` on the connected socket `fd`.
///
/// Returns the number of datagrams handed to the kernel. A short count from
/// the kernel is continued from where it stopped; an error return ends the
/// batch immediately and is reported to the caller.
#[cfg(target_os = "linux")]
pub fn send_batch(fd: RawFd, datagrams: &[&[u8]]) -> io::Result<usize> {
    if datagrams.is_empty() {
        return Ok(0);
    }

    let mut iov: Vec<libc::iovec> = datagrams
        .iter()
        .map(|d| libc::iovec {
            iov_base: d.as_ptr() as *mut libc::c_void,
            iov_len: d.len(),
        })
        .collect();

    let mut msgs: Vec<libc::mmsghdr> = iov
        .iter_mut()
        .map(|v| {
            // Safety: mmsghdr is plain old data, all-zero is a valid value
            let mut m: libc::mmsghdr = unsafe { std::mem::zeroed() };
            m.msg_hdr.msg_iov = v as *mut libc::iovec;
            m.msg_hdr.msg_iovlen = 1;
            m
        })
        .collect();

    let mut sent = 0usize;
    while sent < msgs.len() {
        let remaining = &mut msgs[sent..];
        let retval = unsafe {
            libc::sendmmsg(
                fd,
                remaining.as_mut_ptr(),
                remaining.len() as libc::c_uint,
                0,
            )
        };
        if retval < 0 {
            return Err(io::Error::last_os_error());
        }
        if retval == 0 {
            break;
        }
        sent += retval as usize;
    }

    Ok(sent)
}

#[cfg(not(target_os = "linux"))]
pub fn send_batch(fd: RawFd, datagrams: &[&[u8]]) -> io::Result<usize> {
    let mut sent = 0usize;
    for d in datagrams {
        let retval = unsafe { libc::send(fd, d.as_ptr() as *const libc::c_void, d.len(), 0) };
        if retval < 0 {
            return Err(io::Error::last_os_error());
        }
        sent += 1;
    }
    Ok(sent)
}
