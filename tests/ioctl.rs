mod common;

use std::{
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use atomic_kms::{
    atomic::{atomic_ioctl, AtomicCommitFlags, AtomicRequest},
    device::{Framebuffer, ObjectType, PropertyKind},
    event::DrmEvent,
    fence::{Fence, FenceContext, SyncFile},
    file::{ClientCapability, DrmFile, OutFenceSlots, DEFAULT_EVENT_SPACE, DEFAULT_FD_LIMIT},
    lock::AcquireContext,
    Error,
};

use common::{EventQueue, Fixture};

const FENCE_PTR: u64 = 0x1000;

/// Enables crtc 0 driving connector 0 with primary plane 0 showing `fb`
fn modeset_request(fx: &Fixture, fb: &Framebuffer, flags: AtomicCommitFlags) -> AtomicRequest {
    let core = fx.dev.core_properties();
    let (crtc, plane, connector) = (fx.crtcs[0], fx.primaries[0], fx.connectors[0]);

    let mut req = AtomicRequest::new(flags);
    req.add_property(crtc.id(), core.active, 1)
        .add_property(crtc.id(), core.mode_id, fx.mode_blob())
        .add_property(connector.id(), core.crtc_id, crtc.id().into())
        .add_property(plane.id(), core.fb_id, fb.id().into())
        .add_property(plane.id(), core.crtc_id, crtc.id().into())
        .add_property(plane.id(), core.crtc_w, fb.width() as u64)
        .add_property(plane.id(), core.crtc_h, fb.height() as u64)
        .add_property(plane.id(), core.src_w, (fb.width() as u64) << 16)
        .add_property(plane.id(), core.src_h, (fb.height() as u64) << 16);
    req
}

/// Shows `fb` on primary plane 0
fn flip_request(fx: &Fixture, fb: &Framebuffer, flags: AtomicCommitFlags) -> AtomicRequest {
    let mut req = AtomicRequest::new(flags);
    req.add_property(
        fx.primaries[0].id(),
        fx.dev.core_properties().fb_id,
        fb.id().into(),
    );
    req
}

fn assert_unlocked(fx: &Fixture) {
    for crtc in fx.dev.crtcs() {
        assert!(!crtc.lock().is_locked());
    }
    for plane in fx.dev.planes() {
        assert!(!plane.lock().is_locked());
    }
    assert!(!fx.dev.connection_lock().is_locked());
}

#[test]
fn malformed_requests_are_rejected() {
    let fx = Fixture::new();
    let client = fx.client();
    let invalid = |result: Result<(), Error>| matches!(result, Err(Error::InvalidUsage(_)));

    let legacy = Fixture::build(|builder| {
        builder.atomic(false);
    });
    let legacy_client = legacy.client();
    assert!(invalid(atomic_ioctl(
        &legacy.dev,
        &legacy_client.file,
        &AtomicRequest::default()
    )));

    let (file, _events) = DrmFile::new(Arc::new(OutFenceSlots::new()));
    assert!(invalid(atomic_ioctl(&fx.dev, &file, &AtomicRequest::default())));

    let unknown = AtomicRequest::new(AtomicCommitFlags::from_bits_retain(0x8000));
    assert!(invalid(atomic_ioctl(&fx.dev, &client.file, &unknown)));

    let mut reserved = AtomicRequest::default();
    reserved.reserved = 1;
    assert!(invalid(atomic_ioctl(&fx.dev, &client.file, &reserved)));

    let sync_only = Fixture::build(|builder| {
        builder.async_page_flip(false);
    });
    let sync_client = sync_only.client();
    let flip = AtomicRequest::new(AtomicCommitFlags::PAGE_FLIP_ASYNC);
    assert!(invalid(atomic_ioctl(&sync_only.dev, &sync_client.file, &flip)));

    let test_event = AtomicRequest::new(AtomicCommitFlags::TEST_ONLY | AtomicCommitFlags::PAGE_FLIP_EVENT);
    let err = atomic_ioctl(&fx.dev, &client.file, &test_event).unwrap_err();
    assert_eq!(err.errno(), -libc::EINVAL);

    assert_eq!(fx.boost.kicks(), 0);
    assert_eq!(fx.driver.checks.load(Ordering::SeqCst), 0);
}

#[test]
fn unknown_objects_and_properties() {
    let fx = Fixture::new();
    let client = fx.client();
    let core = fx.dev.core_properties().clone();
    let crtc = fx.crtcs[0];

    let mut req = AtomicRequest::default();
    req.add_property(9999u32, core.active, 1);
    assert_eq!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::UnknownReference(9999))
    );

    let fb = fx.fb(64, 64);
    let mut req = AtomicRequest::default();
    req.add_object(fb.id());
    assert_eq!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::UnknownReference(fb.id().into()))
    );

    let mut req = AtomicRequest::default();
    req.add_property(crtc.id(), core.fb_id, fb.id().into());
    assert_eq!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::UnknownProperty {
            object: crtc.id(),
            property: core.fb_id,
        })
    );

    let mut req = AtomicRequest::default();
    req.add_property(crtc.id(), core.active, 2);
    assert!(matches!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::InvalidUsage(_))
    ));

    let mut req = AtomicRequest::default();
    req.add_property(fx.connectors[0].id(), core.dpms, 0);
    assert_eq!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::Unsupported(core.dpms))
    );

    assert_eq!(fx.driver.commits.load(Ordering::SeqCst), 0);
    assert_eq!(fx.funcs.live_states(), 0);
    assert_unlocked(&fx);
}

#[test]
fn test_only_request_changes_nothing() {
    let fx = Fixture::new();
    let client = fx.client();
    let fb = fx.fb(1920, 1080);

    let req = modeset_request(&fx, &fb, AtomicCommitFlags::TEST_ONLY | AtomicCommitFlags::ALLOW_MODESET);
    atomic_ioctl(&fx.dev, &client.file, &req).unwrap();

    assert_eq!(fx.driver.checks.load(Ordering::SeqCst), 1);
    assert_eq!(fx.driver.commits.load(Ordering::SeqCst), 0);
    assert_eq!(fx.boost.kicks(), 0);
    assert!(!fx.dev.crtc(fx.crtcs[0]).unwrap().current_state().active);
    assert!(fx.dev.plane(fx.primaries[0]).unwrap().legacy_fb().is_none());
    assert_eq!(fx.funcs.live_states(), 0);
    assert_unlocked(&fx);
}

#[test]
fn modeset_delivers_flip_event() {
    let fx = Fixture::new();
    let mut client = fx.client();
    let fb = fx.fb(1920, 1080);

    let mut req = modeset_request(
        &fx,
        &fb,
        AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::ALLOW_MODESET,
    );
    req.user_data = 0xdead;
    atomic_ioctl(&fx.dev, &client.file, &req).unwrap();

    let events = client.events.dispatch();
    assert_eq!(events.len(), 1);
    let DrmEvent::FlipComplete {
        user_data, crtc_id, ..
    } = &events[0];
    assert_eq!(*user_data, 0xdead);
    assert_eq!(*crtc_id, fx.crtcs[0].id().raw());
    assert_eq!(client.file.event_space(), DEFAULT_EVENT_SPACE);

    assert_eq!(fx.boost.kicks(), 1);
    assert!(fx.boost.is_boosted());

    let plane = fx.dev.plane(fx.primaries[0]).unwrap();
    assert!(Arc::ptr_eq(&plane.legacy_fb().unwrap(), &fb));
    assert_eq!(plane.legacy_crtc(), Some(fx.crtcs[0]));
    assert!(fx.dev.crtc(fx.crtcs[0]).unwrap().current_state().active);
    assert_eq!(
        fx.dev.connector(fx.connectors[0]).unwrap().current_state().crtc(),
        Some(fx.crtcs[0])
    );
    assert_eq!(fx.funcs.live_states(), 0);
    assert_unlocked(&fx);
}

#[test]
fn modeset_without_permission_fails() {
    let fx = Fixture::new();
    let mut client = fx.client();
    let fb = fx.fb(1920, 1080);

    let req = modeset_request(&fx, &fb, AtomicCommitFlags::PAGE_FLIP_EVENT);
    assert_eq!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::ModesetNotAllowed(fx.crtcs[0].id()))
    );

    assert!(client.events.dispatch().is_empty());
    assert_eq!(client.file.event_space(), DEFAULT_EVENT_SPACE);
    assert!(!fx.dev.crtc(fx.crtcs[0]).unwrap().current_state().active);
    assert!(fx.dev.plane(fx.primaries[0]).unwrap().legacy_fb().is_none());
    assert_eq!(fx.funcs.live_states(), 0);
}

#[test]
fn out_fence_signals_on_completion() {
    let fx = Fixture::new();
    let mut client = fx.client();
    fx.enable_pipe(&fx.fb(1920, 1080));
    fx.driver.hold_commits.store(true, Ordering::SeqCst);
    client.slots.register(FENCE_PTR);

    let next = fx.fb(1920, 1080);
    let mut req = flip_request(&fx, &next, AtomicCommitFlags::NONBLOCK);
    req.add_property(
        fx.crtcs[0].id(),
        fx.dev.core_properties().out_fence_ptr,
        FENCE_PTR,
    );
    atomic_ioctl(&fx.dev, &client.file, &req).unwrap();

    let fd = client.slots.read(FENCE_PTR).unwrap();
    assert!(fd >= 0);
    assert_eq!(client.file.open_fds(), 1);
    let sync_file = client.file.sync_file(fd).unwrap();
    assert!(!sync_file.is_signaled());
    assert!(Arc::ptr_eq(
        &fx.dev.plane(fx.primaries[0]).unwrap().legacy_fb().unwrap(),
        &next
    ));

    fx.driver.release_held();
    assert!(sync_file.is_signaled());
    // fences alone don't produce events
    assert!(client.events.dispatch().is_empty());

    assert!(client.file.close_fd(fd).is_some());
    assert_eq!(fx.funcs.live_states(), 0);
}

#[test]
fn out_fence_pointer_must_be_writable() {
    let fx = Fixture::new();
    let client = fx.client();
    fx.enable_pipe(&fx.fb(1920, 1080));

    let mut req = AtomicRequest::default();
    req.add_property(
        fx.crtcs[0].id(),
        fx.dev.core_properties().out_fence_ptr,
        0x2000,
    );
    assert_eq!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::Fault(0x2000))
    );
    assert_eq!(client.file.open_fds(), 0);
}

#[test]
fn failed_request_clears_out_fence() {
    let fx = Fixture::new();
    let client = fx.client();
    fx.enable_pipe(&fx.fb(1920, 1080));
    client.slots.register(FENCE_PTR);

    let next = fx.fb(1920, 1080);
    let mut req = flip_request(&fx, &next, AtomicCommitFlags::empty());
    req.add_property(
        fx.crtcs[0].id(),
        fx.dev.core_properties().out_fence_ptr,
        FENCE_PTR,
    );

    fx.driver.fail_commits.store(true, Ordering::SeqCst);
    assert!(matches!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::InvalidUsage(_))
    ));
    assert_eq!(client.slots.read(FENCE_PTR), Some(-1));
    assert_eq!(client.file.open_fds(), 0);
    assert!(fx.dev.plane(fx.primaries[0]).unwrap().legacy_fb().is_none());

    fx.driver.fail_commits.store(false, Ordering::SeqCst);
    req.flags = AtomicCommitFlags::TEST_ONLY;
    client.slots.register(FENCE_PTR);
    atomic_ioctl(&fx.dev, &client.file, &req).unwrap();
    assert_eq!(client.slots.read(FENCE_PTR), Some(-1));
    assert_eq!(client.file.open_fds(), 0);
    assert_eq!(fx.funcs.live_states(), 0);
}

#[test]
fn deadlocks_are_retried() {
    let fx = Fixture::new();
    let mut client = fx.client();
    let fb = fx.fb(1920, 1080);
    fx.driver.inject_deadlocks.store(1, Ordering::SeqCst);

    let req = modeset_request(
        &fx,
        &fb,
        AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::ALLOW_MODESET,
    );
    atomic_ioctl(&fx.dev, &client.file, &req).unwrap();

    assert_eq!(fx.driver.checks.load(Ordering::SeqCst), 2);
    assert_eq!(fx.driver.commits.load(Ordering::SeqCst), 1);
    assert_eq!(client.events.dispatch().len(), 1);
    assert_eq!(client.file.event_space(), DEFAULT_EVENT_SPACE);
    assert_eq!(fx.funcs.live_states(), 0);
    assert_unlocked(&fx);
}

#[test]
fn contended_lock_restarts_request_once() {
    let fx = Fixture::new();
    let client = fx.client();
    let (dev, file) = (&fx.dev, &client.file);
    let clears = || fx.driver.clears.load(Ordering::SeqCst);
    let background = |first: u64, second: u64| {
        let mut req = AtomicRequest::default();
        req.add_property(fx.crtcs[0].id(), fx.background, first)
            .add_property(fx.crtcs[1].id(), fx.background, second);
        req
    };

    atomic_ioctl(dev, file, &background(1, 2)).unwrap();
    let uncontended = clears();

    // an older transaction holds crtc 1, which the request reaches after crtc 0
    let older = AcquireContext::new();
    fx.dev.crtc(fx.crtcs[1]).unwrap().lock().lock(&older).unwrap();

    let req = background(3, 4);
    thread::scope(|s| {
        let request = s.spawn(|| atomic_ioctl(dev, file, &req));
        while clears() == uncontended {
            thread::sleep(Duration::from_millis(1));
        }
        older.drop_locks();
        request.join().unwrap()
    })
    .unwrap();

    assert_eq!(clears(), 2 * uncontended + 1);
    assert_eq!(fx.driver.checks.load(Ordering::SeqCst), 2);
    assert_eq!(fx.driver.commits.load(Ordering::SeqCst), 2);
    assert_eq!(fx.dev.get_property(fx.crtcs[0].id(), fx.background), Ok(3));
    assert_eq!(fx.dev.get_property(fx.crtcs[1].id(), fx.background), Ok(4));
    assert_eq!(fx.funcs.live_states(), 0);
    assert_unlocked(&fx);
}

#[test]
fn immutable_properties_are_read_only() {
    let mut revision = None;
    let fx = Fixture::build(|builder| {
        revision = Some(
            builder
                .immutable_driver_property(
                    ObjectType::Crtc,
                    "revision",
                    PropertyKind::Range { min: 0, max: 16 },
                )
                .unwrap(),
        );
    });
    let revision = revision.unwrap();
    let client = fx.client();
    assert!(fx.dev.property(revision).unwrap().is_immutable());
    assert!(!fx.dev.property(fx.background).unwrap().is_immutable());

    let mut req = AtomicRequest::default();
    req.add_property(fx.crtcs[0].id(), revision, 1);
    assert!(matches!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::InvalidUsage(_))
    ));
    assert_eq!(fx.driver.checks.load(Ordering::SeqCst), 0);
    assert_eq!(fx.funcs.live_states(), 0);
    assert_unlocked(&fx);
}

#[test]
fn nonblocking_flip_completes_later() {
    let fx = Fixture::new();
    let mut client = fx.client();
    fx.enable_pipe(&fx.fb(1920, 1080));

    let next = fx.fb(1920, 1080);
    let mut req = flip_request(
        &fx,
        &next,
        AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK,
    );
    req.user_data = 42;
    atomic_ioctl(&fx.dev, &client.file, &req).unwrap();

    fx.driver.wait_idle();
    let events = client.events.dispatch();
    assert_eq!(events.len(), 1);
    let DrmEvent::FlipComplete { user_data, .. } = &events[0];
    assert_eq!(*user_data, 42);
    assert_eq!(client.file.event_space(), DEFAULT_EVENT_SPACE);
    assert_eq!(fx.funcs.live_states(), 0);
}

#[test]
fn event_on_disabled_crtc_is_rejected() {
    let fx = Fixture::new();
    let mut client = fx.client();

    let mut req = AtomicRequest::new(AtomicCommitFlags::PAGE_FLIP_EVENT);
    req.add_property(fx.crtcs[1].id(), fx.background, 1);
    assert!(matches!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::InvalidUsage(_))
    ));

    assert!(client.events.dispatch().is_empty());
    assert_eq!(client.file.event_space(), DEFAULT_EVENT_SPACE);
    assert_eq!(fx.driver.commits.load(Ordering::SeqCst), 0);
}

#[test]
fn in_fence_is_attached_to_plane() {
    let fx = Fixture::new();
    let client = fx.client();
    fx.enable_pipe(&fx.fb(1920, 1080));

    let fence = Arc::new(Fence::new(FenceContext::alloc(), 1));
    let fd = client
        .file
        .import_sync_file(SyncFile::new(fence.clone()))
        .unwrap();
    let in_fence_fd = fx.dev.core_properties().in_fence_fd;

    let next = fx.fb(1920, 1080);
    let mut req = flip_request(&fx, &next, AtomicCommitFlags::empty());
    req.add_property(fx.primaries[0].id(), in_fence_fd, fd as u64);
    atomic_ioctl(&fx.dev, &client.file, &req).unwrap();

    let plane = fx.dev.plane(fx.primaries[0]).unwrap();
    assert!(Arc::ptr_eq(plane.current_state().fence().unwrap(), &fence));

    let mut req = flip_request(&fx, &next, AtomicCommitFlags::empty());
    req.add_property(fx.primaries[0].id(), in_fence_fd, 7);
    assert!(matches!(
        atomic_ioctl(&fx.dev, &client.file, &req),
        Err(Error::InvalidUsage(_))
    ));
}

#[test]
fn exhausted_event_space_fails_request() {
    let fx = Fixture::new();
    fx.enable_pipe(&fx.fb(1920, 1080));

    let slots = Arc::new(OutFenceSlots::new());
    let (file, channel) = DrmFile::with_limits(slots, 16, DEFAULT_FD_LIMIT);
    file.set_client_capability(ClientCapability::Atomic, true);
    let mut events = EventQueue::new(channel);

    let next = fx.fb(1920, 1080);
    let req = flip_request(&fx, &next, AtomicCommitFlags::PAGE_FLIP_EVENT);
    assert_eq!(atomic_ioctl(&fx.dev, &file, &req), Err(Error::OutOfMemory));

    assert_eq!(file.event_space(), 16);
    assert!(events.dispatch().is_empty());
    assert_eq!(fx.funcs.live_states(), 0);
}

#[test]
fn concurrent_requests_all_succeed() {
    let fx = Fixture::new();
    let client = fx.client();
    let (c0, c1) = (fx.crtcs[0].id(), fx.crtcs[1].id());

    thread::scope(|scope| {
        for (first, second) in [(c0, c1), (c1, c0)] {
            let (fx, file) = (&fx, &client.file);
            scope.spawn(move || {
                for value in 0..50u64 {
                    let mut req = AtomicRequest::default();
                    req.add_property(first, fx.background, value)
                        .add_property(second, fx.background, value);
                    atomic_ioctl(&fx.dev, file, &req).unwrap();
                }
            });
        }
    });

    assert_eq!(fx.driver.commits.load(Ordering::SeqCst), 100);
    assert_eq!(fx.boost.kicks(), 100);
    assert_eq!(fx.funcs.live_states(), 0);
    assert_unlocked(&fx);
}
