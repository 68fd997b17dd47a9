//! Property tests: any message sequence crosses a queue unchanged.

use dsm::consts::{DSM_KEY_QUEUES, DSM_MAGIC, MESSAGE_QUEUE_SIZE, SHM_MAX_SIZE};
use dsm_shared_memory::platform::get_current_pid;
use dsm_shared_memory::{
    Directory, MessageQueue, QueueResult, Received, Region, RegionEstimator, create_queues,
    queue_offset,
};
use proptest::prelude::*;
use std::sync::Arc;

fn queue_pair() -> (Directory, dsm_shared_memory::QueueSender, dsm_shared_memory::QueueReceiver) {
    let mut estimator = RegionEstimator::new();
    estimator.estimate_chunk(MESSAGE_QUEUE_SIZE).unwrap();
    estimator.estimate_keys(1);
    let layout = estimator.estimate().unwrap();
    let region = Arc::new(Region::create(layout.total_size, SHM_MAX_SIZE).unwrap());
    let directory = Directory::create(region, DSM_MAGIC, &layout).unwrap();
    let (chunk, mut senders) = create_queues(&directory, 1, get_current_pid()).unwrap();
    directory.insert(DSM_KEY_QUEUES, chunk).unwrap();

    let queue =
        MessageQueue::attach(directory.region().clone(), queue_offset(chunk, 0).unwrap()).unwrap();
    queue.set_receiver(get_current_pid()).unwrap();
    let receiver = queue.into_receiver().unwrap();
    (directory, senders.remove(0), receiver)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn messages_cross_threads_unchanged(
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40_000), 1..6)
    ) {
        let (_directory, mut sender, mut receiver) = queue_pair();
        let outgoing = messages.clone();
        let writer = std::thread::spawn(move || {
            for message in &outgoing {
                assert_eq!(sender.send(message, true), QueueResult::Success);
            }
        });

        for expected in &messages {
            match receiver.receive(true) {
                Received::Message(bytes) => prop_assert_eq!(&bytes, expected),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
        writer.join().unwrap();
        prop_assert_eq!(receiver.receive(true), Received::Detached);
    }

    #[test]
    fn nonblocking_interleaving_preserves_bytes(
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..20_000), 1..4)
    ) {
        let (_directory, mut sender, mut receiver) = queue_pair();
        let mut received = Vec::new();
        let mut next = 0;

        while received.len() < messages.len() {
            if next < messages.len() && sender.send(&messages[next], false) == QueueResult::Success {
                next += 1;
            }
            if let Received::Message(bytes) = receiver.receive(false) {
                received.push(bytes);
            }
        }
        prop_assert_eq!(received, messages);
    }
}
