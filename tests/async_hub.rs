#![cfg(feature = "async-tokio")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gpio_cdev_hub::mock::MockChip;
use gpio_cdev_hub::{AsyncHub, Bias, Consumer, Drive, EdgeKind, ErrorKind, Hub};
use tokio::time::timeout;

#[derive(Default)]
struct Counter(AtomicUsize);

impl Consumer for Counter {
    fn handle_event(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn is_on(&self) -> bool {
        false
    }

    fn set_on(&self, _on: bool) {}
}

fn started_hub(chip: &MockChip, sensor: &Arc<dyn Consumer>) -> Hub<MockChip> {
    let mut hub = Hub::with_chip("/dev/gpiochip0", chip.clone());
    hub.add_sensor(sensor, 4, false, Bias::PullUp, 50).unwrap();
    hub.startup();
    hub
}

#[tokio::test]
async fn delivers_events_when_readable() {
    let chip = MockChip::new("pinctrl-bcm2711", 54);
    let counter = Arc::new(Counter::default());
    let sensor: Arc<dyn Consumer> = counter.clone();
    let mut hub = AsyncHub::new(started_hub(&chip, &sensor));

    chip.inject_event(4, EdgeKind::Rising);
    chip.inject_event(4, EdgeKind::Falling);

    let delivered = timeout(Duration::from_secs(1), hub.next_events())
        .await
        .expect("no events")
        .unwrap();
    assert_eq!(delivered, 2);
    assert_eq!(counter.0.load(Ordering::SeqCst), 2);

    // Nothing pending: the next wait must not complete.
    assert!(timeout(Duration::from_millis(50), hub.next_events())
        .await
        .is_err());
}

#[tokio::test]
async fn follows_the_session_across_rebuilds() {
    let chip = MockChip::new("pinctrl-bcm2711", 54);
    let door = Arc::new(Counter::default());
    let door_dyn: Arc<dyn Consumer> = door.clone();
    let mut hub = AsyncHub::new(started_hub(&chip, &door_dyn));

    chip.inject_event(4, EdgeKind::Rising);
    timeout(Duration::from_secs(1), hub.next_events())
        .await
        .expect("no events")
        .unwrap();

    let window = Arc::new(Counter::default());
    let window_dyn: Arc<dyn Consumer> = window.clone();
    hub.hub_mut()
        .add_sensor(&window_dyn, 17, false, Bias::PullUp, 50)
        .unwrap();
    assert_eq!(hub.hub().sessions().generation(), 2);

    chip.inject_event(17, EdgeKind::Rising);
    let delivered = timeout(Duration::from_secs(1), hub.next_events())
        .await
        .expect("no events")
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(window.0.load(Ordering::SeqCst), 1);
    assert_eq!(door.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn switch_only_hub_is_not_armed() {
    let chip = MockChip::new("pinctrl-bcm2711", 54);
    let light: Arc<dyn Consumer> = Arc::new(Counter::default());
    let mut hub = Hub::with_chip("/dev/gpiochip0", chip);
    hub.add_switch(&light, 2, false, Bias::AsIs, Drive::PushPull, true)
        .unwrap();
    hub.startup();

    let mut hub = AsyncHub::new(hub);
    let err = hub.next_events().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::NotArmed));

    let hub = hub.into_inner();
    assert!(hub.is_started());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runs_on_a_spawned_task() {
    let chip = MockChip::new("pinctrl-bcm2711", 54);
    let counter = Arc::new(Counter::default());
    let sensor: Arc<dyn Consumer> = counter.clone();
    let mut hub = AsyncHub::new(started_hub(&chip, &sensor));

    let task = tokio::spawn(async move { hub.next_events().await });
    chip.inject_event(4, EdgeKind::Rising);

    let delivered = timeout(Duration::from_secs(1), task)
        .await
        .expect("no events")
        .unwrap()
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
}
