// SharedChannel between a master and a forked child over one MAP_SHARED region

use std::sync::Arc;
use std::time::Duration;

use procpool::ipc::{SharedChannel, SharedRegion};

const MESSAGES: usize = 64;

fn channel_pair(slots: usize, slot_size: usize) -> (SharedChannel, SharedChannel) {
    let len = SharedChannel::footprint(slots, slot_size);
    let region = Arc::new(SharedRegion::anonymous(len * 2).unwrap());
    let down = SharedChannel::init(region.clone(), 0, slots, slot_size).unwrap();
    let up = SharedChannel::init(region, len, slots, slot_size).unwrap();
    (down, up)
}

fn wait_child(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    let reaped = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(reaped, pid);
    assert!(libc::WIFEXITED(status), "child did not exit normally: {:#x}", status);
    libc::WEXITSTATUS(status)
}

#[test]
fn test_child_messages_arrive_in_order() {
    // Fewer slots than messages so the child blocks on a full ring
    let (_, up) = channel_pair(4, 128);

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let mut code = 0;
        for i in 0..MESSAGES {
            let payload = format!("message-{}", i);
            if up.enqueue(payload.as_bytes(), Duration::from_secs(5)).is_err() {
                code = 1;
                break;
            }
        }
        unsafe { libc::_exit(code) };
    }

    for i in 0..MESSAGES {
        let message = up.dequeue(Duration::from_secs(5)).unwrap().expect("message before timeout");
        assert_eq!(message, format!("message-{}", i).as_bytes());
    }
    assert_eq!(wait_child(pid), 0);
    assert!(up.is_empty());
}

#[test]
fn test_request_reply_across_fork() {
    let (down, up) = channel_pair(8, 64);

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let code = loop {
            match down.dequeue(Duration::from_secs(5)) {
                Ok(Some(request)) => {
                    let reply: Vec<u8> = request.iter().rev().copied().collect();
                    if up.enqueue(&reply, Duration::from_secs(5)).is_err() {
                        break 2;
                    }
                }
                Ok(None) => break 3,
                // Closed and drained
                Err(_) => break 0,
            }
        };
        unsafe { libc::_exit(code) };
    }

    for word in ["alpha", "bravo", "charlie"] {
        down.enqueue(word.as_bytes(), Duration::from_secs(1)).unwrap();
        let reply = up.dequeue(Duration::from_secs(5)).unwrap().expect("reply before timeout");
        assert_eq!(reply, word.chars().rev().collect::<String>().as_bytes());
    }
    down.close();
    assert_eq!(wait_child(pid), 0);
}
