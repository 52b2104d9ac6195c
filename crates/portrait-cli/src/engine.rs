use portrait_core::{
    normalize, Emotion, IndexError, LandmarkId, NormalizeError, PaintingId, Point, RegionWeights,
    SimilarityIndex,
};
use portrait_ingest::{Store, StoreError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("invalid query landmarks: {0}")]
    Landmarks(#[from] NormalizeError),
    #[error("painting {0} is indexed but missing from the store")]
    MissingPainting(PaintingId),
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// One query hit with the stored images attached.
pub struct Retrieved {
    pub painting_id: PaintingId,
    pub landmark_id: LandmarkId,
    pub distance: f64,
    pub painting_bytes: Vec<u8>,
    /// The face crop, when one was saved during analysis.
    pub portrait_bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub entries: usize,
    pub partitions: Vec<PartitionSize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionSize {
    /// `None` for faces without a predicted category.
    pub category: Option<Emotion>,
    pub entries: usize,
}

/// Messages sent from callers to the engine thread.
enum EngineRequest {
    Retrieve {
        points: Vec<Point>,
        category: Option<Emotion>,
        k: usize,
        reply: oneshot::Sender<Result<Vec<Retrieved>, EngineError>>,
    },
    Reload {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Normalize raw landmarks and return the `k` closest paintings of `category`.
    pub async fn retrieve(
        &self,
        points: Vec<Point>,
        category: Option<Emotion>,
        k: usize,
    ) -> Result<Vec<Retrieved>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Retrieve {
                points,
                category,
                k,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Rebuild the index from a fresh store snapshot. Returns the entry count.
    pub async fn reload(&self) -> Result<usize, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Reload { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Stats { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the query engine on a dedicated OS thread.
///
/// The engine owns the store and the similarity index built from it. The
/// first build happens here, so a broken store fails fast.
pub fn spawn_engine(store: Store, weights: RegionWeights) -> Result<EngineHandle, EngineError> {
    let mut index = build_index(&store, weights)?;
    tracing::info!(entries = index.len(), "similarity index loaded");

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("portrait-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Retrieve {
                        points,
                        category,
                        k,
                        reply,
                    } => {
                        let result = run_retrieve(&store, &index, &points, category, k);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Reload { reply } => {
                        let result = build_index(&store, weights).map(|fresh| {
                            index = fresh;
                            index.len()
                        });
                        match &result {
                            Ok(entries) => tracing::info!(entries, "similarity index rebuilt"),
                            Err(e) => tracing::warn!(error = %e, "reload failed; keeping previous index"),
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Stats { reply } => {
                        let _ = reply.send(stats(&index));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn build_index(store: &Store, weights: RegionWeights) -> Result<SimilarityIndex, EngineError> {
    let features = store.features()?;
    Ok(SimilarityIndex::build(&features, weights)?)
}

fn stats(index: &SimilarityIndex) -> EngineStats {
    EngineStats {
        entries: index.len(),
        partitions: index
            .partition_sizes()
            .into_iter()
            .map(|(category, entries)| PartitionSize { category, entries })
            .collect(),
    }
}

fn run_retrieve(
    store: &Store,
    index: &SimilarityIndex,
    points: &[Point],
    category: Option<Emotion>,
    k: usize,
) -> Result<Vec<Retrieved>, EngineError> {
    let vector = normalize(points)?;
    let matches = index.query(&vector, category, k)?;
    tracing::debug!(category = ?category, k, hits = matches.len(), "query answered");

    matches
        .into_iter()
        .map(|m| {
            let painting = store
                .painting(m.painting_id)?
                .ok_or(EngineError::MissingPainting(m.painting_id))?;
            let painting_bytes = read(&painting.image_ref)?;
            let portrait_bytes = match store.face_ref(m.landmark_id)? {
                Some(path) => read(&path)
                    .map_err(|e| tracing::warn!(landmark_id = m.landmark_id, error = %e, "face crop unreadable"))
                    .ok(),
                None => None,
            };
            Ok(Retrieved {
                painting_id: m.painting_id,
                landmark_id: m.landmark_id,
                distance: m.distance,
                painting_bytes,
                portrait_bytes,
            })
        })
        .collect()
}

fn read(path: &Path) -> Result<Vec<u8>, EngineError> {
    std::fs::read(path).map_err(|source| EngineError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use portrait_core::alignment::canonical_template;
    use portrait_core::BoundingBox;
    use portrait_ingest::{DedupStore, FaceRecord};

    fn face(stretch: f64) -> Vec<Point> {
        canonical_template()
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| {
                // widen the mouth to move a face away from the template
                let y = if i >= 48 { y * stretch } else { y };
                (20.0 + 100.0 * x, 20.0 + 100.0 * y)
            })
            .collect()
    }

    fn add_face(
        store: &Store,
        dir: &Path,
        remote_id: &str,
        points: Vec<Point>,
        category: Option<Emotion>,
    ) -> (PaintingId, LandmarkId) {
        let image_ref = dir.join(format!("{remote_id}.jpg"));
        std::fs::write(&image_ref, format!("painting {remote_id}")).unwrap();
        let face_ref = dir.join(format!("{remote_id}_0.jpg"));
        std::fs::write(&face_ref, format!("face {remote_id}")).unwrap();

        let painting_id = store.mark_fetched(remote_id, "https://catalog.test", &image_ref).unwrap();
        let vector = normalize(&points).unwrap();
        let landmark_id = store
            .insert_face(&FaceRecord {
                painting_id,
                bounding_box: BoundingBox { left: 0.0, top: 0.0, right: 10.0, bottom: 10.0 },
                posed_vector: vector.clone(),
                vector,
                points,
                category,
                face_ref: Some(face_ref),
            })
            .unwrap();
        (painting_id, landmark_id)
    }

    #[tokio::test]
    async fn test_retrieve_nearest_with_images() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let (near, near_face) = add_face(&store, dir.path(), "near", face(1.02), None);
        let (far, _) = add_face(&store, dir.path(), "far", face(1.4), None);

        let engine = spawn_engine(store, RegionWeights::default()).unwrap();
        let hits = engine.retrieve(face(1.0), None, 5).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!((hits[0].painting_id, hits[0].landmark_id), (near, near_face));
        assert_eq!(hits[1].painting_id, far);
        assert!(hits[0].distance <= hits[1].distance);
        assert_eq!(hits[0].painting_bytes, b"painting near");
        assert_eq!(hits[0].portrait_bytes.as_deref(), Some(&b"face near"[..]));
    }

    #[tokio::test]
    async fn test_retrieve_restricted_to_category() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        add_face(&store, dir.path(), "smile", face(1.0), Some(Emotion::Happy));
        let (sad, _) = add_face(&store, dir.path(), "frown", face(1.3), Some(Emotion::Sad));

        let engine = spawn_engine(store, RegionWeights::default()).unwrap();
        let hits = engine.retrieve(face(1.0), Some(Emotion::Sad), 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].painting_id, sad);

        let none = engine.retrieve(face(1.0), Some(Emotion::Fear), 3).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_reload_sees_new_faces() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("portrait.db");
        let writer = Store::open(&db).unwrap();
        add_face(&writer, dir.path(), "first", face(1.0), None);

        let engine = spawn_engine(Store::open(&db).unwrap(), RegionWeights::default()).unwrap();
        assert_eq!(engine.stats().await.unwrap().entries, 1);

        add_face(&writer, dir.path(), "second", face(1.1), Some(Emotion::Neutral));
        assert_eq!(engine.retrieve(face(1.0), None, 5).await.unwrap().len(), 1);

        assert_eq!(engine.reload().await.unwrap(), 2);
        let stats = engine.stats().await.unwrap();
        assert_eq!(
            stats.partitions,
            vec![
                PartitionSize { category: None, entries: 1 },
                PartitionSize { category: Some(Emotion::Neutral), entries: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_bad_query_landmarks() {
        let store = Store::open_in_memory().unwrap();
        let engine = spawn_engine(store, RegionWeights::default()).unwrap();
        let err = engine.retrieve(vec![(0.0, 0.0); 10], None, 3).await.err().unwrap();
        assert!(matches!(err, EngineError::Landmarks(NormalizeError::WrongPointCount(10))));
    }
}
