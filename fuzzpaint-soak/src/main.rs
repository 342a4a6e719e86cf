//! # Soak
//!
//! Hammers one document with strokes from many threads while this (owning) thread locks, unlocks and waits on it.
//! Usage: `fuzzpaint-soak [strokes]`. Exits with an error if the document fails to settle.
#![warn(clippy::pedantic)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fuzzpaint_image::compressor::{OverlaySubject, SubjectID, UpdateRequestCompressor};
use fuzzpaint_image::config::ImageConfig;
use fuzzpaint_image::document::{Document, DocumentMessage, WeakDocument};
use fuzzpaint_image::jobs::StrokeJob;
use fuzzpaint_image::owner_loop::OwnerLoop;
use fuzzpaint_image::scratch::{BufferKind, SafeScratchBufferStore, ScratchBuffer};
use fuzzpaint_image::stroke::{SimpleStrokeStrategy, StrokeFlags};
use fuzzpaint_image::util::{Rect, UpdateRegion};
use fuzzpaint_image::wait_broker::WaitBroker;

use anyhow::Result as AnyResult;

const JOBS_PER_STROKE: usize = 12;
const TILE_SIZE: u32 = 64;

/// Toy pixel storage, one u16 per pixel.
#[derive(Clone)]
struct Tile {
    kind: BufferKind,
    pixels: Vec<u16>,
}
impl Tile {
    fn prototype(kind: BufferKind) -> Self {
        Self {
            kind,
            pixels: vec![1; (TILE_SIZE * TILE_SIZE) as usize],
        }
    }
}
impl ScratchBuffer for Tile {
    fn kind(&self) -> BufferKind {
        self.kind
    }
    fn is_compatible(&self, prototype: &Self) -> bool {
        self.kind == prototype.kind && self.pixels.len() == prototype.pixels.len()
    }
    fn new_like(prototype: &Self) -> Self {
        Self {
            kind: prototype.kind,
            pixels: vec![0; prototype.pixels.len()],
        }
    }
    fn reshape_like(&mut self, prototype: &Self) {
        self.kind = prototype.kind;
        self.pixels.resize(prototype.pixels.len(), 0);
    }
    fn clear(&mut self) {
        self.pixels.fill(0);
    }
    fn composite(&mut self, source: &Self, rect: Rect) {
        let size = TILE_SIZE as usize;
        let clip = |start: i32, len: u32| {
            let start = usize::try_from(start).unwrap_or(0).min(size);
            start..(start + len as usize).min(size)
        };
        for y in clip(rect.y, rect.height) {
            for x in clip(rect.x, rect.width) {
                let idx = y * size + x;
                self.pixels[idx] = self.pixels[idx].saturating_add(source.pixels[idx]);
            }
        }
    }
}

/// Stand-in for a selection whose outline must follow its edits.
struct Selection {
    document: WeakDocument,
    recomputed: AtomicUsize,
}
impl OverlaySubject for Selection {
    fn document(&self) -> Option<Document> {
        self.document.upgrade()
    }
    fn recompute_overlay(&self, region: UpdateRegion) {
        log::trace!("Selection outline recomputed for {region:?}");
        self.recomputed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default, Debug)]
struct Stats {
    barrier_locks: usize,
    emergency_locks: usize,
    try_locks_won: usize,
    try_locks_lost: usize,
    updates: usize,
    end_requests: usize,
    jobs_during_wait: usize,
}

fn produce(
    document: &Document,
    store: &Arc<SafeScratchBufferStore<Tile>>,
    compressor: &UpdateRequestCompressor,
    strokes: usize,
    jobs_during_wait: &Arc<AtomicUsize>,
) {
    use rayon::iter::{IntoParallelIterator, ParallelIterator};
    (0..strokes).into_par_iter().for_each(|i| {
        let mut flags = StrokeFlags::REQUESTS_OTHER_STROKES_TO_END;
        if i % 4 == 0 {
            flags |= StrokeFlags::CAN_FORGET_ABOUT_ME;
        }
        if i % 8 == 0 {
            flags |= StrokeFlags::EXCLUSIVE;
        }
        let strategy = SimpleStrokeStrategy::new(format!("soak-{i}")).with_flags(flags);
        let stroke = document.start_stroke(Arc::new(strategy));

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let rect = Rect::new((i % 48) as i32, (i / 48 % 48) as i32, 16, 16);
        for j in 0..JOBS_PER_STROKE {
            let store = store.clone();
            let jobs_during_wait = jobs_during_wait.clone();
            let work = move || {
                let prototype = Tile::prototype(if j % 5 == 0 {
                    BufferKind::Mask
                } else {
                    BufferKind::Pixels
                });
                let buffer = store.fetch(&prototype);
                buffer.write().composite(&prototype, rect);
                if WaitBroker::instance().is_some_and(|broker| broker.gui_is_waiting()) {
                    jobs_during_wait.fetch_add(1, Ordering::Relaxed);
                }
            };
            let job = match j % 3 {
                0 => StrokeJob::sequential(work),
                1 => StrokeJob::concurrent(work),
                _ => StrokeJob::barrier(work),
            };
            document.add_job(stroke, job);
        }
        {
            let store = store.clone();
            document.add_job(stroke, StrokeJob::barrier(move || store.release()));
        }
        if i % 16 == 15 {
            document.cancel_stroke(stroke);
        } else {
            document.end_stroke(stroke);
        }
        compressor.request_update(rect);
        document.request_projection_update(&[rect]);
    });
}

fn drain_messages(reader: &mut bus::BusReader<DocumentMessage>, stats: &mut Stats) {
    while let Ok(message) = reader.try_recv() {
        match message {
            DocumentMessage::Updated(_) => stats.updates += 1,
            DocumentMessage::StrokeEndRequested => stats.end_requests += 1,
            _ => (),
        }
    }
}

fn main() -> AnyResult<()> {
    let has_term = std::io::IsTerminal::is_terminal(&std::io::stdin());
    // Log to a terminal, if available. Else, log to "log.out" in the working directory.
    if has_term {
        env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        let _ = simple_logging::log_to_file("log.out", log::LevelFilter::Debug);
    }

    let strokes: usize = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(256);

    let config = ImageConfig::get();
    if config.did_fail_to_load() {
        log::warn!("Image config is broken, leaving it alone. Running with defaults.");
    } else if let Err(e) = config.save() {
        log::warn!("Failed to save image config:\n{e:?}");
    }

    let broker = WaitBroker::init();
    broker.set_feedback_callback(Some(Arc::new(|document| {
        log::trace!("Owner blocking on {document}");
    })));

    let document = Document::from_config(config)?;
    let mut messages = document.listen();
    let owner = OwnerLoop::new();

    let selection = Arc::new(Selection {
        document: document.downgrade(),
        recomputed: AtomicUsize::new(0),
    });
    let compressor = {
        let subject = Arc::downgrade(&selection);
        let subject: Weak<dyn OverlaySubject> = subject;
        UpdateRequestCompressor::new(
            &owner.handle(),
            SubjectID::next(),
            subject,
            config.update_delay(),
        )
    };
    let store = Arc::new(SafeScratchBufferStore::new(document.downgrade()));
    let jobs_during_wait = Arc::new(AtomicUsize::new(0));

    let started = std::time::Instant::now();
    let produced = AtomicBool::new(false);
    let mut stats = Stats::default();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            produce(&document, &store, &compressor, strokes, &jobs_during_wait);
            produced.store(true, Ordering::Release);
        });
        let mut round = 0usize;
        while !produced.load(Ordering::Acquire) {
            owner.process_events(Duration::from_millis(2));
            drain_messages(&mut messages, &mut stats);
            round += 1;
            match round % 10 {
                0 => {
                    document.barrier_lock(false);
                    stats.barrier_locks += 1;
                    document.unlock();
                }
                5 => {
                    document.lock();
                    stats.emergency_locks += 1;
                    document.unlock();
                }
                _ => {
                    if document.try_barrier_lock(true) {
                        stats.try_locks_won += 1;
                        document.unlock();
                    } else {
                        stats.try_locks_lost += 1;
                    }
                }
            }
        }
    });

    document.wait_for_done();
    // Let the last overlay request settle and run.
    let settled = owner.run_until(Duration::from_secs(5), || {
        compressor.pending_region().is_nothing() && !compressor.has_stalled_update()
    });
    document.wait_for_done();
    drain_messages(&mut messages, &mut stats);
    stats.jobs_during_wait = jobs_during_wait.load(Ordering::Relaxed);

    log::info!(
        "{strokes} strokes in {:?}, {} overlay recomputes, buffers (dirty, clean) {:?}",
        started.elapsed(),
        selection.recomputed.load(Ordering::Relaxed),
        store.pooled(),
    );
    log::info!("{stats:#?}");

    if !settled {
        anyhow::bail!("overlay updates never settled");
    }
    if !document.is_idle(false) {
        anyhow::bail!("document still busy after waiting");
    }
    drop(document);
    WaitBroker::shutdown();
    Ok(())
}
