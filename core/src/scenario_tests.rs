//! End-to-end scenarios against the simulated PMU: session lifecycle,
//! counter virtualization across hardware wraps, sampling, notification,
//! blocking, inheritance and the cross-CPU protocols.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use perfmon_hal::{PmuBackend, SimPmu, Tunables};

use crate::context::{CtxFlags, CtxState};
use crate::error::PmuError;
use crate::monitor::{Monitor, SessionId};
use crate::regset::RegSet;
use crate::session::{CreateRequest, PmcArg, PmdArg, RegArgFlags};
use crate::task::TaskHandle;

struct Rig {
    mon: Arc<Monitor>,
    sim: Arc<SimPmu>,
}

fn rig(cpus: usize) -> Rig {
    let sim = Arc::new(SimPmu::new(cpus));
    let backend: Arc<dyn PmuBackend> = sim.clone();
    Rig {
        mon: Arc::new(Monitor::new(backend, Arc::new(Tunables::new()))),
        sim,
    }
}

fn counter_mask(rig: &Rig) -> u64 {
    rig.mon.backend().description().counter_mask()
}

/// Create + enable on cpu 0 + program pmc4/pmd4 + start.
fn running_session(rig: &Rig, task: TaskHandle, req: CreateRequest, pmd: PmdArg) -> SessionId {
    let resp = rig.mon.create_session(task, &req).unwrap();
    let sid = resp.session;
    rig.mon.enable(task, 0, sid).unwrap();
    rig.mon
        .write_pmcs(task, sid, &mut [PmcArg::new(4, 0x1)])
        .unwrap();
    rig.mon.write_pmds(task, sid, &mut [pmd]).unwrap();
    rig.mon.start(task, 0, sid).unwrap();
    sid
}

fn read_pmd4(rig: &Rig, task: TaskHandle, cpu: usize, sid: SessionId) -> u64 {
    let mut args = [PmdArg::new(4, 0)];
    rig.mon.read_pmds(task, cpu, sid, &mut args).unwrap();
    args[0].value
}

#[test]
fn task_and_system_sessions_exclude_each_other() {
    let r = rig(2);
    let a = r.mon.register_task();
    let b = r.mon.register_task();

    let resp = r.mon.create_session(a, &CreateRequest::default()).unwrap();

    let mut sys = CreateRequest::default();
    sys.flags = CtxFlags::SYSTEM_WIDE;
    sys.cpu_mask = 1 << 1;
    assert_eq!(r.mon.create_session(b, &sys).err(), Some(PmuError::Busy));

    r.mon.destroy(a, resp.session).unwrap();
    let sys_resp = r.mon.create_session(b, &sys).unwrap();
    assert_eq!(
        r.mon.create_session(a, &CreateRequest::default()).err(),
        Some(PmuError::Busy)
    );
    r.mon.destroy(b, sys_resp.session).unwrap();
    r.mon.create_session(a, &CreateRequest::default()).unwrap();
}

#[test]
fn written_values_read_back_with_live_deltas() {
    let r = rig(1);
    let task = r.mon.register_task();
    let resp = r.mon.create_session(task, &CreateRequest::default()).unwrap();
    let sid = resp.session;
    r.mon.enable(task, 0, sid).unwrap();
    r.mon
        .write_pmcs(task, sid, &mut [PmcArg::new(4, 0x1)])
        .unwrap();
    r.mon
        .write_pmds(task, sid, &mut [PmdArg::new(4, 500)])
        .unwrap();

    // Round trip with monitoring stopped, then again with live deltas.
    assert_eq!(read_pmd4(&r, task, 0, sid), 500);
    r.mon.start(task, 0, sid).unwrap();
    assert!(r.sim.tick(0, 4, 25));
    assert_eq!(read_pmd4(&r, task, 0, sid), 525);
}

#[test]
fn stop_is_idempotent_and_keeps_values() {
    let r = rig(1);
    let task = r.mon.register_task();
    let sid = running_session(&r, task, CreateRequest::default(), PmdArg::new(4, 10));

    assert!(r.sim.tick(0, 4, 5));
    r.mon.stop(task, sid).unwrap();
    let value = read_pmd4(&r, task, 0, sid);
    assert_eq!(value, 15);

    // Ticks no longer land, and stopping again changes nothing.
    assert!(!r.sim.tick(0, 4, 100));
    r.mon.stop(task, sid).unwrap();
    assert_eq!(read_pmd4(&r, task, 0, sid), value);
}

#[test]
fn hardware_wrap_extends_to_sixty_four_bits() {
    let r = rig(1);
    let task = r.mon.register_task();
    let mask = counter_mask(&r);
    let sid = running_session(&r, task, CreateRequest::default(), PmdArg::new(4, mask));

    assert_eq!(read_pmd4(&r, task, 0, sid), mask);
    assert!(r.sim.tick(0, 4, 1));
    r.mon.handle_interrupt(0, 0x4000);

    // One event past the hardware width: the virtual value keeps going
    // and the hardware register was folded down to zero.
    assert_eq!(r.mon.backend().read_pmd(0, 4), 0);
    assert_eq!(read_pmd4(&r, task, 0, sid), mask + 1);
    assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Active);
    assert!(r.sim.tick(0, 4, 3));
    assert_eq!(read_pmd4(&r, task, 0, sid), mask + 4);
}

#[test]
fn out_of_range_cpu_is_rejected() {
    let r = rig(1);
    let task = r.mon.register_task();
    let resp = r.mon.create_session(task, &CreateRequest::default()).unwrap();
    let sid = resp.session;

    assert_eq!(
        r.mon.enable(task, 5, sid).err(),
        Some(PmuError::InvalidArgument)
    );
    r.mon.enable(task, 0, sid).unwrap();
    assert_eq!(
        r.mon.start(task, 5, sid).err(),
        Some(PmuError::InvalidArgument)
    );
    let mut args = [PmdArg::new(4, 0)];
    assert_eq!(
        r.mon.read_pmds(task, 5, sid, &mut args).err(),
        Some(PmuError::InvalidArgument)
    );
}

#[test]
fn true_overflow_notifies_and_freezes_until_restart() {
    let r = rig(1);
    let task = r.mon.register_task();
    let mut req = CreateRequest::default();
    req.notify = Some(task);

    let mut pmd = PmdArg::new(4, u64::MAX);
    pmd.long_reset = u64::MAX;
    pmd.flags = RegArgFlags::OVFL_NOTIFY;
    let sid = running_session(&r, task, req, pmd);

    assert!(r.sim.tick(0, 4, 1));
    r.mon.handle_interrupt(0, 0x4000);

    assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Frozen);
    let signals = r.mon.tasks().take_signals(task);
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].ovfl_regs, 1 << 4);
    // Frozen hardware drops further events.
    assert!(!r.sim.tick(0, 4, 50));

    r.mon.restart(task, sid).unwrap();
    assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Active);
    assert_eq!(read_pmd4(&r, task, 0, sid), u64::MAX);
}

#[test]
fn restart_rearms_every_overflowed_counter() {
    let r = rig(1);
    let task = r.mon.register_task();
    let mut req = CreateRequest::default();
    req.notify = Some(task);
    let resp = r.mon.create_session(task, &req).unwrap();
    let sid = resp.session;
    r.mon.enable(task, 0, sid).unwrap();
    r.mon
        .write_pmcs(task, sid, &mut [PmcArg::new(4, 0x1), PmcArg::new(5, 0x1)])
        .unwrap();
    let mut with_notify = PmdArg::new(4, u64::MAX);
    with_notify.long_reset = 1000;
    with_notify.flags = RegArgFlags::OVFL_NOTIFY;
    let mut silent = PmdArg::new(5, u64::MAX);
    silent.long_reset = 2000;
    r.mon
        .write_pmds(task, sid, &mut [with_notify, silent])
        .unwrap();
    r.mon.start(task, 0, sid).unwrap();

    // Both counters wrap in the same interrupt; only pmd4 notifies.
    r.sim.raise_overflow(0, (1 << 4) | (1 << 5));
    r.mon.handle_interrupt(0, 0x4000);
    assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Frozen);
    let signals = r.mon.tasks().take_signals(task);
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].ovfl_regs, 1 << 4);

    // The restart long-resets every counter that overflowed, not just
    // the notifying one.
    r.mon.restart(task, sid).unwrap();
    let mut args = [PmdArg::new(4, 0), PmdArg::new(5, 0)];
    r.mon.read_pmds(task, 0, sid, &mut args).unwrap();
    assert_eq!(args[0].value, 1000);
    assert_eq!(args[1].value, 2000);
}

#[test]
fn silent_sampling_recycles_a_full_buffer() {
    let r = rig(1);
    let task = r.mon.register_task();
    let mut req = CreateRequest::default();
    req.smpl_entries = 4;
    req.smpl_regs = RegSet::from_mask(1 << 4);

    let mut pmd = PmdArg::new(4, u64::MAX);
    pmd.short_reset = u64::MAX;
    let sid = running_session(&r, task, req, pmd);
    let buf = r.mon.get(sid).unwrap().lock().buffer.clone().unwrap();

    // The fourth sample fills the buffer; with nobody to notify it is
    // recycled on the spot and the fifth lands in slot zero again.
    // Counting resumes after every overflow.
    for (i, expected_count) in [1, 2, 3, 0, 1].into_iter().enumerate() {
        assert!(r.sim.tick(0, 4, 1));
        r.mon.handle_interrupt(0, 0x5000 + i as u64);
        assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Active);
        assert_eq!(buf.header().count, expected_count);
    }
    assert_eq!(buf.full_events(), 1);
    assert_eq!(buf.record(0).unwrap().entry.ip, 0x5004);
}

#[test]
fn full_buffer_with_notification_defers_the_reset() {
    let r = rig(1);
    let task = r.mon.register_task();
    let mut req = CreateRequest::default();
    req.notify = Some(task);
    req.smpl_entries = 4;
    req.smpl_regs = RegSet::from_mask(1 << 4);

    let mut pmd = PmdArg::new(4, u64::MAX);
    pmd.long_reset = u64::MAX;
    pmd.flags = RegArgFlags::OVFL_NOTIFY;
    let sid = running_session(&r, task, req, pmd);
    let view = r.mon.get(sid).unwrap().lock().buffer.clone().unwrap();

    for i in 0..4 {
        assert!(r.sim.tick(0, 4, 1));
        r.mon.handle_interrupt(0, 0x4000 + i);
        assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Frozen);
        if i < 3 {
            r.mon.restart(task, sid).unwrap();
        }
    }

    // Four entries stand; the reset waits for the final restart so the
    // consumer sees the full buffer.
    assert_eq!(view.header().count, 4);
    assert_eq!(view.record(3).unwrap().entry.ip, 0x4003);
    assert_eq!(view.full_events(), 1);

    r.mon.restart(task, sid).unwrap();
    assert_eq!(view.header().count, 0);
    assert_eq!(r.mon.tasks().take_signals(task).len(), 4);
}

#[test]
fn dead_notification_target_freezes_without_panic() {
    let r = rig(1);
    let owner = r.mon.register_task();
    let watcher = r.mon.register_task();
    let mut req = CreateRequest::default();
    req.notify = Some(watcher);

    let mut pmd = PmdArg::new(4, u64::MAX);
    pmd.long_reset = u64::MAX;
    pmd.flags = RegArgFlags::OVFL_NOTIFY;
    let sid = running_session(&r, owner, req, pmd);

    // The watcher dies first; its handle goes stale before the overflow.
    r.mon.task_exit(watcher);

    assert!(r.sim.tick(0, 4, 1));
    r.mon.handle_interrupt(0, 0x4000);
    assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Frozen);

    // The owner can still recover the session.
    r.mon.restart(owner, sid).unwrap();
    assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Active);
}

#[test]
fn teardown_racing_the_interrupt_stays_safe() {
    for _ in 0..50 {
        let r = rig(1);
        let owner = r.mon.register_task();
        let watcher = r.mon.register_task();
        let mut req = CreateRequest::default();
        req.notify = Some(watcher);

        let mut pmd = PmdArg::new(4, u64::MAX);
        pmd.long_reset = u64::MAX;
        pmd.flags = RegArgFlags::OVFL_NOTIFY;
        let sid = running_session(&r, owner, req, pmd);
        r.sim.raise_overflow(0, 1 << 4);

        let barrier = Arc::new(Barrier::new(2));
        let exiting = {
            let mon = Arc::clone(&r.mon);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                mon.task_exit(watcher);
            })
        };
        let interrupting = {
            let mon = Arc::clone(&r.mon);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                mon.handle_interrupt(0, 0x4000);
            })
        };
        exiting.join().unwrap();
        interrupting.join().unwrap();

        // Whichever side won, the session froze; a watcher handle that
        // went stale mid-delivery is dropped, and the owner can still
        // recover the session.
        assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Frozen);
        r.mon.restart(owner, sid).unwrap();
        assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Active);
    }
}

#[test]
fn blocking_notification_parks_until_restart() {
    let r = rig(1);
    let owner = r.mon.register_task();
    let watcher = r.mon.register_task();
    let mut req = CreateRequest::default();
    req.flags = CtxFlags::BLOCKING;
    req.notify = Some(watcher);

    let mut pmd = PmdArg::new(4, u64::MAX);
    pmd.long_reset = u64::MAX;
    pmd.flags = RegArgFlags::OVFL_NOTIFY;
    let sid = running_session(&r, owner, req, pmd);

    assert!(r.sim.tick(0, 4, 1));
    r.mon.handle_interrupt(0, 0x4000);
    assert_eq!(r.mon.tasks().take_signals(watcher).len(), 1);

    let parked = {
        let mon = Arc::clone(&r.mon);
        thread::spawn(move || mon.return_to_user(owner))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!parked.is_finished());

    r.mon.restart(watcher, sid).unwrap();
    parked.join().unwrap();
    assert_eq!(r.mon.session_state(sid).unwrap(), CtxState::Active);
}

#[test]
fn batch_stops_at_the_first_invalid_argument() {
    let r = rig(1);
    let task = r.mon.register_task();
    let resp = r.mon.create_session(task, &CreateRequest::default()).unwrap();
    let sid = resp.session;
    r.mon.enable(task, 0, sid).unwrap();

    let mut args = [
        PmcArg::new(4, 0x1),
        PmcArg::new(63, 0x1),
        PmcArg::new(5, 0x2),
    ];
    assert_eq!(
        r.mon.write_pmcs(task, sid, &mut args).err(),
        Some(PmuError::InvalidArgument)
    );
    assert!(args[1].flags.contains(RegArgFlags::RETFL_INVALID));
    assert!(!args[0].flags.contains(RegArgFlags::RETFL_INVALID));

    // The first write stuck, the one after the invalid slot never ran.
    assert_eq!(r.mon.backend().read_pmc(0, 4), 0x1);
    assert_eq!(r.mon.backend().read_pmc(0, 5), 0);
}

#[test]
fn context_follows_the_task_across_cpus() {
    let r = rig(2);
    let task = r.mon.register_task();
    let sid = running_session(&r, task, CreateRequest::default(), PmdArg::new(4, 40));

    assert!(r.sim.tick(0, 4, 2));
    r.mon.switch_out(task, 0);
    assert!(!r.sim.tick(0, 4, 100));

    r.mon.switch_in(task, 1);
    assert!(r.mon.backend().monitoring(1));
    assert!(r.sim.tick(1, 4, 3));
    assert_eq!(read_pmd4(&r, task, 1, sid), 45);
}

#[test]
fn same_cpu_switch_restores_the_control_word() {
    let r = rig(1);
    let task = r.mon.register_task();
    let sid = running_session(&r, task, CreateRequest::default(), PmdArg::new(4, 40));

    assert!(r.sim.tick(0, 4, 2));
    r.mon.switch_out(task, 0);
    assert!(!r.mon.backend().monitoring(0));
    r.mon.switch_in(task, 0);
    assert!(r.mon.backend().monitoring(0));
    assert!(r.sim.tick(0, 4, 3));
    assert_eq!(read_pmd4(&r, task, 0, sid), 45);

    // A stopped session comes back with monitoring still off.
    r.mon.stop(task, sid).unwrap();
    r.mon.switch_out(task, 0);
    r.mon.switch_in(task, 0);
    assert!(!r.mon.backend().monitoring(0));
}

#[test]
fn disable_racing_a_remote_fetch_saves_exactly_once() {
    let r = rig(2);
    let task = r.mon.register_task();
    let reader = r.mon.register_task();
    let resp = r.mon.create_session(task, &CreateRequest::default()).unwrap();
    let sid = resp.session;
    r.mon
        .write_pmds(task, sid, &mut [PmdArg::new(4, 500)])
        .unwrap();

    // Monitoring never starts, so the virtual value must read 500 no
    // matter how bind/unbind cycles interleave with remote fetches. A
    // flush that re-saves a context already pulled off the CPU would
    // fold the hardware value in a second time.
    let binder = {
        let mon = Arc::clone(&r.mon);
        thread::spawn(move || {
            for _ in 0..200 {
                let _ = mon.enable(task, 0, sid);
                let _ = mon.disable(task, sid);
            }
        })
    };
    let remote = {
        let mon = Arc::clone(&r.mon);
        thread::spawn(move || {
            for _ in 0..200 {
                let mut args = [PmdArg::new(4, 0)];
                if mon.read_pmds(reader, 1, sid, &mut args).is_ok() {
                    assert_eq!(args[0].value, 500);
                }
            }
        })
    };
    binder.join().unwrap();
    remote.join().unwrap();

    assert_eq!(read_pmd4(&r, task, 0, sid), 500);
    let ctx = r.mon.get(sid).unwrap();
    if ctx.owner_cpu() == Some(0) {
        assert_eq!(r.mon.owners().owner(0), Some(sid));
    }
}

#[test]
fn remote_reads_fetch_current_state() {
    let r = rig(2);
    let task = r.mon.register_task();
    let sid = running_session(&r, task, CreateRequest::default(), PmdArg::new(4, 7));
    assert!(r.sim.tick(0, 4, 13));

    // Read from cpu 1 while the registers live on cpu 0: the state is
    // pulled over first, so the delta is visible.
    assert_eq!(read_pmd4(&r, task, 1, sid), 20);
    let ctx = r.mon.get(sid).unwrap();
    assert_eq!(ctx.owner_cpu(), None);
}

#[test]
fn fork_inheritance_restarts_child_counters() {
    let r = rig(2);
    let parent = r.mon.register_task();
    let mut req = CreateRequest::default();
    req.flags = CtxFlags::INHERIT_ALL;

    let mut pmd = PmdArg::new(4, 100);
    pmd.long_reset = 100;
    let _sid = running_session(&r, parent, req, pmd);
    assert!(r.sim.tick(0, 4, 50));

    let child = r.mon.task_fork(parent).unwrap();
    let child_sid = r.mon.tasks().session_of(child).unwrap();
    r.mon.switch_in(child, 1);

    // The child counts from the long reset value, not the parent's total.
    assert_eq!(read_pmd4(&r, child, 1, child_sid), 100);
    assert!(r.sim.tick(1, 4, 5));
    assert_eq!(read_pmd4(&r, child, 1, child_sid), 105);

    // And the grandchild inherits again under INHERIT_ALL.
    let grandchild = r.mon.task_fork(child).unwrap();
    assert!(r.mon.tasks().session_of(grandchild).is_some());
}

#[test]
fn inherit_once_stops_after_one_generation() {
    let r = rig(1);
    let parent = r.mon.register_task();
    let mut req = CreateRequest::default();
    req.flags = CtxFlags::INHERIT_ONCE;
    r.mon.create_session(parent, &req).unwrap();

    let child = r.mon.task_fork(parent).unwrap();
    assert!(r.mon.tasks().session_of(child).is_some());
    let grandchild = r.mon.task_fork(child).unwrap();
    assert!(r.mon.tasks().session_of(grandchild).is_none());
}

#[test]
fn concurrent_rebinding_settles_on_one_owner() {
    let r = rig(1);
    let mut workers = Vec::new();
    let mut sids = Vec::new();
    for _ in 0..2 {
        let task = r.mon.register_task();
        let resp = r.mon.create_session(task, &CreateRequest::default()).unwrap();
        sids.push(resp.session);
        let mon = Arc::clone(&r.mon);
        let sid = resp.session;
        workers.push(thread::spawn(move || {
            for _ in 0..100 {
                if mon.enable(task, 0, sid).is_ok() {
                    let _ = mon.start(task, 0, sid);
                    let _ = mon.stop(task, sid);
                    let _ = mon.disable(task, sid);
                }
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
    // Whatever interleaving happened, at most one session owns the CPU
    // and the registry still accounts both sessions.
    let snapshot = r.mon.registry().snapshot();
    assert_eq!(snapshot.task_sessions, 2);
    for sid in sids {
        let ctx = r.mon.get(sid).unwrap();
        if let Some(cpu) = ctx.owner_cpu() {
            assert_eq!(cpu, 0);
        }
    }
}

#[test]
fn protected_sessions_refuse_other_callers() {
    let r = rig(1);
    let owner = r.mon.register_task();
    let other = r.mon.register_task();
    let resp = r.mon.create_session(owner, &CreateRequest::default()).unwrap();
    let sid = resp.session;

    assert_eq!(
        r.mon.protect(other, sid).err(),
        Some(PmuError::PermissionDenied)
    );
    r.mon.protect(owner, sid).unwrap();
    assert_eq!(r.mon.stop(other, sid).err(), Some(PmuError::PermissionDenied));
    assert_eq!(
        r.mon.destroy(other, sid).err(),
        Some(PmuError::PermissionDenied)
    );
    r.mon.unprotect(owner, sid).unwrap();
    r.mon.destroy(other, sid).unwrap();
}

#[test]
fn watchpoints_follow_the_session_lifetime() {
    let r = rig(1);
    let task = r.mon.register_task();
    let resp = r.mon.create_session(task, &CreateRequest::default()).unwrap();
    let sid = resp.session;

    r.mon
        .use_watchpoints(task, sid, RegSet::from_mask(0b11))
        .unwrap();
    assert_eq!(r.mon.registry().claim_debugger(), Err(PmuError::Busy));

    // Destroying the session releases the reservation.
    r.mon.destroy(task, sid).unwrap();
    r.mon.registry().claim_debugger().unwrap();
}

#[test]
fn system_session_binds_to_its_one_cpu() {
    let r = rig(2);
    let task = r.mon.register_task();
    let mut req = CreateRequest::default();
    req.flags = CtxFlags::SYSTEM_WIDE;
    req.cpu_mask = 1 << 1;
    let resp = r.mon.create_session(task, &req).unwrap();
    let sid = resp.session;

    assert_eq!(
        r.mon.enable(task, 0, sid).err(),
        Some(PmuError::InvalidArgument)
    );
    r.mon.enable(task, 1, sid).unwrap();
    r.mon
        .write_pmcs(task, sid, &mut [PmcArg::new(4, 0x1)])
        .unwrap();
    r.mon
        .write_pmds(task, sid, &mut [PmdArg::new(4, 0)])
        .unwrap();
    r.mon.start(task, 1, sid).unwrap();
    assert!(r.sim.tick(1, 4, 9));
    assert_eq!(read_pmd4(&r, task, 1, sid), 9);

    assert_eq!(r.mon.tasks().pinned(task), Some(1));
    r.mon.destroy(task, sid).unwrap();
    assert_eq!(r.mon.tasks().pinned(task), None);
}

#[test]
fn create_rejects_contradictory_flags() {
    let r = rig(1);
    let task = r.mon.register_task();

    let mut req = CreateRequest::default();
    req.flags = CtxFlags::INHERIT_ONCE | CtxFlags::INHERIT_ALL;
    assert_eq!(
        r.mon.create_session(task, &req).err(),
        Some(PmuError::InvalidArgument)
    );

    let mut req = CreateRequest::default();
    req.flags = CtxFlags::BLOCKING;
    // Blocking without a notification target is meaningless.
    assert_eq!(
        r.mon.create_session(task, &req).err(),
        Some(PmuError::InvalidArgument)
    );

    let mut req = CreateRequest::default();
    req.flags = CtxFlags::SYSTEM_WIDE;
    req.cpu_mask = 0b11;
    assert_eq!(
        r.mon.create_session(task, &req).err(),
        Some(PmuError::InvalidArgument)
    );
}
