//! Bounded per-unit transport between probe producers and the single
//! dispatcher. One fixed-capacity ring per hardware execution unit, sized at
//! construction and never resized. `push` is wait-free; a full ring drops the
//! record and counts the drop instead of blocking.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use provtrace_common::MAX_RECORD_LEN;
use tokio::sync::Notify;

/// One raw encoded record, copied into a fixed-size slot.
#[derive(Clone, Copy)]
pub struct RawRecord {
	len: u16,
	bytes: [u8; MAX_RECORD_LEN],
}

impl RawRecord {
	/// Copies `data` into a slot. Anything beyond the largest legal encoding
	/// is cut off and will surface as a decode failure, not as corruption of
	/// a neighboring slot.
	pub fn new(data: &[u8]) -> Self {
		let len = data.len().min(MAX_RECORD_LEN);
		let mut bytes = [0u8; MAX_RECORD_LEN];
		bytes[..len].copy_from_slice(&data[..len]);
		Self { len: len as u16, bytes }
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.bytes[..self.len as usize]
	}
}

const EMPTY_RECORD: RawRecord = RawRecord {
	len: 0,
	bytes: [0u8; MAX_RECORD_LEN],
};

/// Single-producer single-consumer ring. The producer side is the unit's
/// [`RingProducer`]; the consumer side is the dispatcher, via
/// [`BufferConsumer::drain_into`]. `head`/`tail` are free-running counters,
/// reduced modulo capacity on slot access.
pub struct Ring {
	slots: Box<[UnsafeCell<RawRecord>]>,
	head: AtomicUsize,
	tail: AtomicUsize,
	overflow: AtomicU64,
}

// Slot access is partitioned: the producer writes only slots in
// [head, tail), the consumer reads only the slot at head, and the
// Acquire/Release pairs on head/tail order those accesses.
unsafe impl Sync for Ring {}

impl Ring {
	fn new(capacity: usize) -> Self {
		assert!(capacity > 0, "ring capacity must be non-zero");
		let slots = (0..capacity).map(|_| UnsafeCell::new(EMPTY_RECORD)).collect();
		Self {
			slots,
			head: AtomicUsize::new(0),
			tail: AtomicUsize::new(0),
			overflow: AtomicU64::new(0),
		}
	}

	fn capacity(&self) -> usize {
		self.slots.len()
	}

	/// Wait-free. Returns `false` and bumps the overflow counter when full.
	fn push(&self, record: RawRecord) -> bool {
		let tail = self.tail.load(Ordering::Relaxed);
		let head = self.head.load(Ordering::Acquire);
		if tail.wrapping_sub(head) >= self.capacity() {
			self.overflow.fetch_add(1, Ordering::Relaxed);
			return false;
		}
		unsafe {
			*self.slots[tail % self.capacity()].get() = record;
		}
		self.tail.store(tail.wrapping_add(1), Ordering::Release);
		true
	}

	/// Consumer only.
	fn pop(&self) -> Option<RawRecord> {
		let head = self.head.load(Ordering::Relaxed);
		let tail = self.tail.load(Ordering::Acquire);
		if head == tail {
			return None;
		}
		let record = unsafe { *self.slots[head % self.capacity()].get() };
		self.head.store(head.wrapping_add(1), Ordering::Release);
		Some(record)
	}

	pub fn overflow(&self) -> u64 {
		self.overflow.load(Ordering::Relaxed)
	}

	fn add_overflow(&self, n: u64) {
		self.overflow.fetch_add(n, Ordering::Relaxed);
	}
}

/// The tracer's transport: one [`Ring`] per unit plus the wakeup for the
/// idle dispatcher. Producers never wait on the consumer; the consumer
/// idle-waits on `notify` when every ring reports empty.
pub struct CaptureBuffer {
	rings: Box<[Ring]>,
	notify: Notify,
	poison: Mutex<Option<String>>,
}

impl CaptureBuffer {
	/// Builds the buffer and hands out exactly one producer per unit plus
	/// exactly one consumer; the one-producer-per-ring and one-consumer write
	/// disciplines both fall out of handle ownership.
	pub fn new(units: usize, capacity_per_unit: usize) -> (Arc<Self>, BufferConsumer, Vec<RingProducer>) {
		assert!(units > 0, "need at least one unit ring");
		let rings = (0..units).map(|_| Ring::new(capacity_per_unit)).collect();
		let buffer = Arc::new(Self {
			rings,
			notify: Notify::new(),
			poison: Mutex::new(None),
		});
		let producers = (0..units as u32)
			.map(|unit| RingProducer {
				buffer: buffer.clone(),
				unit,
			})
			.collect();
		let consumer = BufferConsumer { buffer: buffer.clone() };
		(buffer, consumer, producers)
	}

	pub fn unit_count(&self) -> usize {
		self.rings.len()
	}

	pub fn overflow_total(&self) -> u64 {
		self.rings.iter().map(Ring::overflow).sum()
	}

	pub fn ring(&self, unit: u32) -> &Ring {
		&self.rings[unit as usize]
	}

	/// Marks the transport unusable. Drains already-buffered records still
	/// succeed; the dispatcher surfaces the failure after its final pass.
	pub fn poison(&self, reason: impl Into<String>) {
		let mut poison = self.poison.lock().unwrap_or_else(|e| e.into_inner());
		poison.get_or_insert_with(|| reason.into());
		drop(poison);
		self.notify.notify_one();
	}

	pub fn poison_reason(&self) -> Option<String> {
		self.poison.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}
}

/// Exclusive drain handle for the whole buffer. Deliberately not `Clone`
/// and draining through `&mut self`: the rings' consumer side is safe only
/// single-threaded, the same way [`RingProducer`] guards the producer side.
pub struct BufferConsumer {
	buffer: Arc<CaptureBuffer>,
}

impl BufferConsumer {
	/// A shared view of the underlying buffer, for poisoning and counters.
	pub fn shared(&self) -> Arc<CaptureBuffer> {
		self.buffer.clone()
	}

	/// Collects every currently available record across all rings, in per-ring
	/// FIFO order, appending `(unit_id, record)` pairs to `batch`. Never
	/// blocks; returns the number of records taken.
	pub fn drain_into(&mut self, batch: &mut Vec<(u32, RawRecord)>) -> usize {
		let before = batch.len();
		for (unit, ring) in self.buffer.rings.iter().enumerate() {
			while let Some(record) = ring.pop() {
				batch.push((unit as u32, record));
			}
		}
		batch.len() - before
	}

	/// Parks the consumer until a producer pushes or the buffer is poisoned.
	pub async fn wait_for_records(&self) {
		self.buffer.notify.notified().await;
	}

	pub fn overflow_total(&self) -> u64 {
		self.buffer.overflow_total()
	}

	pub fn poison_reason(&self) -> Option<String> {
		self.buffer.poison_reason()
	}
}

/// Exclusive write handle for one unit's ring.
pub struct RingProducer {
	buffer: Arc<CaptureBuffer>,
	unit: u32,
}

impl RingProducer {
	pub fn unit(&self) -> u32 {
		self.unit
	}

	/// Wait-free; returns `false` when the ring was full and the record was
	/// dropped (and counted).
	pub fn push(&self, data: &[u8]) -> bool {
		let pushed = self.buffer.ring(self.unit).push(RawRecord::new(data));
		self.buffer.notify.notify_one();
		pushed
	}

	/// Folds transport drops that happened upstream (kernel-side lost
	/// samples) into this ring's overflow counter.
	pub fn add_lost(&self, n: u64) {
		if n > 0 {
			self.buffer.ring(self.unit).add_overflow(n);
		}
	}
}

// region:    --- Tests

#[cfg(test)]
mod tests {
	use super::*;

	fn fx_record(byte: u8) -> Vec<u8> {
		vec![byte; 8]
	}

	#[test]
	fn ring_delivers_in_push_order() {
		let (buffer, mut consumer, producers) = CaptureBuffer::new(1, 8);
		let producer = &producers[0];

		for i in 0..8u8 {
			assert!(producer.push(&fx_record(i)));
		}

		let mut batch = Vec::new();
		assert_eq!(consumer.drain_into(&mut batch), 8);
		for (i, (unit, record)) in batch.iter().enumerate() {
			assert_eq!(*unit, 0);
			assert_eq!(record.as_bytes(), fx_record(i as u8).as_slice());
		}
		assert_eq!(buffer.overflow_total(), 0);
	}

	#[test]
	fn ring_full_drops_and_counts_without_blocking() {
		let (buffer, mut consumer, producers) = CaptureBuffer::new(1, 2);
		let producer = &producers[0];

		assert!(producer.push(&fx_record(1)));
		assert!(producer.push(&fx_record(2)));
		assert!(!producer.push(&fx_record(3)));

		let mut batch = Vec::new();
		assert_eq!(consumer.drain_into(&mut batch), 2);
		assert_eq!(batch[0].1.as_bytes(), fx_record(1).as_slice());
		assert_eq!(batch[1].1.as_bytes(), fx_record(2).as_slice());
		assert_eq!(buffer.overflow_total(), 1);
	}

	#[test]
	fn ring_overflow_counts_exactly_the_excess() {
		let fx_capacity = 4;
		let fx_excess = 7;
		let (buffer, mut consumer, producers) = CaptureBuffer::new(1, fx_capacity);
		let producer = &producers[0];

		for i in 0..(fx_capacity + fx_excess) {
			producer.push(&fx_record(i as u8));
		}

		assert_eq!(buffer.overflow_total(), fx_excess as u64);

		// The ring is reusable once drained.
		let mut batch = Vec::new();
		consumer.drain_into(&mut batch);
		assert!(producer.push(&fx_record(9)));
		assert_eq!(buffer.overflow_total(), fx_excess as u64);
	}

	#[test]
	fn ring_drain_interleaves_with_pushes() {
		let (_buffer, mut consumer, producers) = CaptureBuffer::new(1, 2);
		let producer = &producers[0];
		let mut batch = Vec::new();

		producer.push(&fx_record(1));
		producer.push(&fx_record(2));
		consumer.drain_into(&mut batch);
		producer.push(&fx_record(3));
		consumer.drain_into(&mut batch);

		let seen: Vec<u8> = batch.iter().map(|(_, r)| r.as_bytes()[0]).collect();
		assert_eq!(seen, vec![1, 2, 3]);
	}

	#[test]
	fn buffer_keeps_units_separate() {
		let (_buffer, mut consumer, producers) = CaptureBuffer::new(3, 4);

		producers[2].push(&fx_record(2));
		producers[0].push(&fx_record(0));

		let mut batch = Vec::new();
		consumer.drain_into(&mut batch);
		let units: Vec<u32> = batch.iter().map(|(unit, _)| *unit).collect();
		assert_eq!(units, vec![0, 2]);
	}

	#[test]
	fn buffer_lost_counts_fold_into_overflow() {
		let (buffer, _consumer, producers) = CaptureBuffer::new(2, 4);

		producers[1].add_lost(5);
		producers[0].push(&fx_record(1));

		assert_eq!(buffer.ring(1).overflow(), 5);
		assert_eq!(buffer.overflow_total(), 5);
	}

	#[test]
	fn buffer_consumer_handle_sees_each_record_once_across_threads() {
		let total = 1024u16;
		let (_buffer, mut consumer, producers) = CaptureBuffer::new(1, total as usize);
		let producer = producers.into_iter().next().unwrap();

		let pusher = std::thread::spawn(move || {
			for i in 0..total {
				assert!(producer.push(&i.to_ne_bytes()));
			}
		});

		let mut batch = Vec::new();
		while batch.len() < total as usize {
			consumer.drain_into(&mut batch);
		}
		pusher.join().unwrap();

		let seen: Vec<u16> = batch
			.iter()
			.map(|(_, record)| {
				let bytes = record.as_bytes();
				u16::from_ne_bytes([bytes[0], bytes[1]])
			})
			.collect();
		assert_eq!(seen, (0..total).collect::<Vec<u16>>());
	}

	#[test]
	fn buffer_poison_is_sticky_and_keeps_first_reason() {
		let (buffer, _consumer, _producers) = CaptureBuffer::new(1, 4);

		assert_eq!(buffer.poison_reason(), None);
		buffer.poison("perf read failed");
		buffer.poison("second failure");
		assert_eq!(buffer.poison_reason().as_deref(), Some("perf read failed"));
	}
}

// endregion: --- Tests
