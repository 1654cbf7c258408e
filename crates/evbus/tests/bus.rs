//! Bus behaviour end-to-end, including the fiber-blocking wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use evbus::{DispatchCache, Event, EventBus, EventValue, SourceId, EVENT_ANY, ID_ANY};
use fiber::{Scheduler, SchedulerConfig};

type Recorder = Arc<Mutex<Vec<String>>>;

fn recorder() -> Recorder {
    Arc::new(Mutex::new(Vec::new()))
}

fn fixture() -> (Arc<Scheduler>, Arc<EventBus>) {
    let sched = Scheduler::new(SchedulerConfig::default());
    sched.init().unwrap();
    let bus = EventBus::new(Arc::clone(&sched));
    (sched, bus)
}

fn listen_recording(bus: &EventBus, rec: &Recorder, label: &'static str, s: SourceId, v: EventValue) {
    let rec = Arc::clone(rec);
    bus.listen(s, v, move |_| rec.lock().push(label.into()));
}

#[test]
fn listeners_fire_in_registration_order() {
    let (_sched, bus) = fixture();
    let rec = recorder();

    listen_recording(&bus, &rec, "first", SourceId(1), EventValue(1));
    listen_recording(&bus, &rec, "second", ID_ANY, EventValue(1));
    listen_recording(&bus, &rec, "third", SourceId(1), EVENT_ANY);

    bus.send(Event::new(SourceId(1), EventValue(1), 0));
    assert_eq!(*rec.lock(), ["first", "second", "third"]);
}

#[test]
fn wildcards_select_the_expected_listeners() {
    let (_sched, bus) = fixture();
    let rec = recorder();

    listen_recording(&bus, &rec, "exact", SourceId(1), EventValue(2));
    listen_recording(&bus, &rec, "any-source", ID_ANY, EventValue(2));
    listen_recording(&bus, &rec, "any-value", SourceId(1), EVENT_ANY);
    listen_recording(&bus, &rec, "any-any", ID_ANY, EVENT_ANY);

    bus.send(Event::new(SourceId(1), EventValue(2), 0));
    assert_eq!(*rec.lock(), ["exact", "any-source", "any-value", "any-any"]);

    rec.lock().clear();
    bus.send(Event::new(SourceId(9), EventValue(2), 0));
    assert_eq!(*rec.lock(), ["any-source", "any-any"]);

    rec.lock().clear();
    bus.send(Event::new(SourceId(1), EventValue(9), 0));
    assert_eq!(*rec.lock(), ["any-value", "any-any"]);

    rec.lock().clear();
    bus.send(Event::new(SourceId(9), EventValue(9), 0));
    assert_eq!(*rec.lock(), ["any-any"]);
}

#[test]
fn post_stamps_the_scheduler_clock() {
    let (sched, bus) = fixture();
    let rec = recorder();

    let rec2 = Arc::clone(&rec);
    bus.listen(SourceId(1), EventValue(1), move |event| {
        rec2.lock().push(format!("t={}", event.timestamp));
    });

    sched.tick();
    sched.tick();
    bus.post(SourceId(1), EventValue(1));
    assert_eq!(*rec.lock(), [format!("t={}", sched.millis())]);
}

#[test]
fn handlers_may_send_re_entrantly() {
    let (_sched, bus) = fixture();
    let rec = recorder();

    let inner_bus = Arc::clone(&bus);
    let rec2 = Arc::clone(&rec);
    bus.listen(SourceId(1), EventValue(1), move |_| {
        rec2.lock().push("outer".into());
        inner_bus.send(Event::new(SourceId(2), EventValue(2), 0));
    });
    listen_recording(&bus, &rec, "inner", SourceId(2), EventValue(2));

    bus.send(Event::new(SourceId(1), EventValue(1), 0));
    assert_eq!(*rec.lock(), ["outer", "inner"]);
}

#[test]
fn registration_from_a_handler_applies_to_the_next_send() {
    let (_sched, bus) = fixture();
    let rec = recorder();

    let registered = Arc::new(AtomicBool::new(false));
    let outer_bus = Arc::clone(&bus);
    let rec_outer = Arc::clone(&rec);
    bus.listen(SourceId(1), EventValue(1), move |_| {
        rec_outer.lock().push("outer".into());
        if !registered.swap(true, Ordering::SeqCst) {
            let rec_late = Arc::clone(&rec_outer);
            outer_bus.listen(SourceId(1), EventValue(1), move |_| {
                rec_late.lock().push("late".into());
            });
        }
    });

    bus.send(Event::new(SourceId(1), EventValue(1), 0));
    assert_eq!(*rec.lock(), ["outer"]);

    bus.send(Event::new(SourceId(1), EventValue(1), 0));
    assert_eq!(*rec.lock(), ["outer", "outer", "late"]);
}

#[test]
fn wait_for_blocks_until_a_matching_event() {
    let (sched, bus) = fixture();
    let rec = recorder();

    let fiber_bus = Arc::clone(&bus);
    let rec2 = Arc::clone(&rec);
    sched
        .create_fiber(move || {
            rec2.lock().push("waiting".into());
            fiber_bus.wait_for(SourceId(1), EventValue(1)).unwrap();
            rec2.lock().push("woken".into());
        })
        .unwrap();

    // Let the fiber register its waker and park.
    sched.schedule();
    assert_eq!(*rec.lock(), ["waiting"]);

    // A non-matching event must not wake it.
    bus.post(SourceId(1), EventValue(2));
    sched.schedule();
    assert_eq!(*rec.lock(), ["waiting"]);

    bus.post(SourceId(1), EventValue(1));
    sched.schedule();
    assert_eq!(*rec.lock(), ["waiting", "woken"]);
    assert_eq!(sched.stats().active, 1);
}

#[test]
fn wait_for_honours_wildcard_axes() {
    let (sched, bus) = fixture();
    let rec = recorder();

    let fiber_bus = Arc::clone(&bus);
    let rec2 = Arc::clone(&rec);
    sched
        .create_fiber(move || {
            fiber_bus.wait_for(ID_ANY, EventValue(7)).unwrap();
            rec2.lock().push("woken".into());
        })
        .unwrap();

    sched.schedule();
    bus.post(SourceId(42), EventValue(7));
    sched.schedule();
    assert_eq!(*rec.lock(), ["woken"]);
}

#[test]
fn fired_waker_invalidates_an_outstanding_cache() {
    let (sched, bus) = fixture();
    let rec = recorder();

    // The waker registers first, so the plain listener sits behind it in
    // the chain and shifts down when the waker unlinks itself.
    let fiber_bus = Arc::clone(&bus);
    let rec_fiber = Arc::clone(&rec);
    sched
        .create_fiber(move || {
            fiber_bus.wait_for(SourceId(1), EventValue(1)).unwrap();
            rec_fiber.lock().push("woken".into());
        })
        .unwrap();
    sched.schedule();
    listen_recording(&bus, &rec, "plain", SourceId(1), EventValue(1));

    let mut cache = DispatchCache::new();
    let event = Event::new(SourceId(1), EventValue(1), 0);
    bus.send_cached(event, &mut cache);
    sched.schedule();
    assert_eq!(*rec.lock(), ["plain", "woken"]);

    // The one-shot removal mutated the chain, so the cached position must
    // not be trusted; the rescan still reaches the shifted listener.
    bus.send_cached(event, &mut cache);
    assert_eq!(*rec.lock(), ["plain", "woken", "plain"]);
}
