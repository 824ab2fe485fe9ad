// SPDX-License-Identifier: Apache-2.0

//! Discovery of free TCP ports for a server to listen on.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};

use rand::Rng;

use crate::error::{Error, Result};

/// Finds a port in `[min, max]` that can currently be bound on `bind_addr`.
///
/// `next_candidate` receives `(min, max, last_tried)` and returns the next
/// port to probe. A candidate outside the range, or having tried every port
/// in the range, ends the search with [`Error::NoPortAvailable`].
///
/// A successful probe only means the port was free at the time of the
/// check; the server may still lose a race for it.
pub fn find_open_port<F>(
    bind_addr: IpAddr,
    min: u16,
    max: u16,
    mut next_candidate: F,
    log: &dyn Fn(&str),
) -> Result<u16>
where
    F: FnMut(u16, u16, Option<u16>) -> u16,
{
    if min > max {
        return Err(Error::NoPortAvailable { min, max });
    }

    let range_size = usize::from(max - min) + 1;
    let mut tried = HashSet::new();
    let mut last = None;
    // Random candidates repeat; allow a generous number of draws before giving up.
    let max_draws = range_size.saturating_mul(8).max(64);

    for _ in 0..max_draws {
        let candidate = next_candidate(min, max, last);
        last = Some(candidate);
        if candidate < min || candidate > max {
            log(&format!("port candidate {candidate} is outside {min}-{max}"));
            break;
        }
        if !tried.insert(candidate) {
            continue;
        }

        log(&format!("trying port {candidate}"));
        if port_is_open(bind_addr, candidate) {
            log(&format!("port {candidate} looks available"));
            return Ok(candidate);
        }
        log(&format!("port {candidate} is in use"));

        if tried.len() >= range_size {
            break;
        }
    }

    Err(Error::NoPortAvailable { min, max })
}

/// Probes a port by binding a listener and releasing it immediately.
pub fn port_is_open(bind_addr: IpAddr, port: u16) -> bool {
    TcpListener::bind((bind_addr, port)).is_ok()
}

/// Candidate strategy picking uniformly random ports in the range.
pub fn random_candidates() -> impl FnMut(u16, u16, Option<u16>) -> u16 {
    let mut rng = rand::rng();
    move |min, max, _last| rng.random_range(min..=max)
}

/// Candidate strategy starting at `hint` and walking upwards one port at a time.
pub fn sequential_from(hint: u16) -> impl FnMut(u16, u16, Option<u16>) -> u16 {
    move |_min, _max, last| match last {
        None => hint,
        Some(port) => port.saturating_add(1),
    }
}

/// Finds a random open port on the loopback interface.
pub fn find_random_open_port(min: u16, max: u16, log: &dyn Fn(&str)) -> Result<u16> {
    find_open_port(loopback(), min, max, random_candidates(), log)
}

/// Finds the first open port on the loopback interface at or above `hint`.
pub fn find_first_open_port_from(
    hint: u16,
    min: u16,
    max: u16,
    log: &dyn Fn(&str),
) -> Result<u16> {
    find_open_port(loopback(), min, max, sequential_from(hint), log)
}

/// Finds a random open port on the loopback interface other than `exclude`.
pub fn find_random_open_port_except(
    exclude: u16,
    min: u16,
    max: u16,
    log: &dyn Fn(&str),
) -> Result<u16> {
    let mut random = random_candidates();
    let candidates = move |lo: u16, hi: u16, last: Option<u16>| loop {
        let candidate = random(lo, hi, last);
        if candidate != exclude || lo == hi {
            break candidate;
        }
    };
    find_open_port(loopback(), min, max, candidates, log)
}

fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
