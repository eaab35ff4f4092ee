use super::*;

fn drain(queue: &mut PriorityQueue) -> Vec<String> {
    std::iter::from_fn(|| queue.pop().map(|entry| entry.task_id)).collect()
}

#[test]
fn test_urgent_jumps_ahead_of_earlier_low() {
    let mut queue = PriorityQueue::new();
    queue.push("low-1", TaskPriority::Low, 1);
    queue.push("low-2", TaskPriority::Low, 2);
    queue.push("urgent", TaskPriority::Urgent, 3);

    assert_eq!(drain(&mut queue), vec!["urgent", "low-1", "low-2"]);
}

#[test]
fn test_fifo_within_priority() {
    let mut queue = PriorityQueue::new();
    for (idx, id) in ["a", "b", "c", "d"].iter().enumerate() {
        queue.push(id, TaskPriority::High, idx as u64);
    }
    queue.push("m", TaskPriority::Medium, 0);

    assert_eq!(drain(&mut queue), vec!["a", "b", "c", "d", "m"]);
}

#[test]
fn test_remove_drops_only_the_named_task() {
    let mut queue = PriorityQueue::new();
    queue.push("a", TaskPriority::Low, 1);
    queue.push("b", TaskPriority::High, 2);

    assert!(queue.remove("a"));
    assert!(!queue.remove("a"));
    assert_eq!(queue.len(), 1);
    assert_eq!(drain(&mut queue), vec!["b"]);
}

#[test]
fn test_empty_queue() {
    let mut queue = PriorityQueue::new();
    assert!(queue.is_empty());
    assert!(queue.pop().is_none());
}
