use std::collections::HashMap;

use canvas_core::{Course, File, Folder};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::SyncError;
use super::tasks::send;

/// Consistency violations between the folder and file listings of one course.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("folders {first} and {second} both claim to be the root folder")]
    DuplicateRoot { first: u64, second: u64 },
    #[error("folder {folder_id} references unknown parent folder {parent_id}")]
    MissingParent { folder_id: u64, parent_id: u64 },
    #[error("file {file_id} references unknown folder {folder_id}")]
    MissingFileOwner { file_id: u64, folder_id: u64 },
    #[error("folder {0} was listed more than once")]
    DuplicateFolder(u64),
    #[error("none of the {0} listed folders is a root folder")]
    MissingRoot(usize),
    #[error("{0} folders are not reachable from the root folder")]
    UnreachableFolders(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeFolder {
    pub folder: Folder,
    pub folders: Vec<TreeFolder>,
    pub files: Vec<File>,
}

impl TreeFolder {
    /// Depth-first, pre-order walk over this folder and all of its descendants.
    pub fn walk(&self) -> impl Iterator<Item = &TreeFolder> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let folder = stack.pop()?;
            stack.extend(folder.folders.iter().rev());
            Some(folder)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseTree {
    pub course: Course,
    /// `None` when the course listed no folders at all.
    pub root: Option<TreeFolder>,
}

impl CourseTree {
    pub fn folders(&self) -> impl Iterator<Item = &TreeFolder> {
        self.root.iter().flat_map(|root| root.walk())
    }

    pub fn file_count(&self) -> usize {
        self.folders().map(|folder| folder.files.len()).sum()
    }
}

#[derive(Debug)]
struct PendingFolder {
    folder: Folder,
    children: Vec<u64>,
    files: Vec<File>,
}

/// Assembles a [`CourseTree`] from folder and file batches arriving in any
/// order. Folders are registered first and linked to their parents once the
/// folder listing is complete; files may be attached at any time after their
/// folder was registered.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    nodes: HashMap<u64, PendingFolder>,
    root: Option<u64>,
    linked: bool,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a batch of folders and returns the ids of those that declare
    /// files, in batch order.
    pub fn add_folders(&mut self, batch: Vec<Folder>) -> Result<Vec<u64>, TreeError> {
        let mut with_files = Vec::new();
        for folder in batch {
            if self.nodes.contains_key(&folder.id) {
                return Err(TreeError::DuplicateFolder(folder.id));
            }
            if folder.files_count > 0 {
                with_files.push(folder.id);
            }
            self.nodes.insert(
                folder.id,
                PendingFolder {
                    folder,
                    children: Vec::new(),
                    files: Vec::new(),
                },
            );
        }
        Ok(with_files)
    }

    pub fn add_files(&mut self, batch: Vec<File>) -> Result<(), TreeError> {
        for file in batch {
            let owner = self
                .nodes
                .get_mut(&file.folder_id)
                .ok_or(TreeError::MissingFileOwner {
                    file_id: file.id,
                    folder_id: file.folder_id,
                })?;
            owner.files.push(file);
        }
        Ok(())
    }

    /// Links every registered folder to its parent. Must run after the last
    /// folder batch; calling it twice is a no-op.
    pub fn link(&mut self) -> Result<(), TreeError> {
        if self.linked {
            return Ok(());
        }
        // Sorted so children lists and error reports do not depend on arrival order.
        let mut edges: Vec<(u64, Option<u64>)> = self
            .nodes
            .iter()
            .map(|(id, node)| (*id, node.folder.parent_folder_id))
            .collect();
        edges.sort_unstable();

        for (folder_id, parent) in edges {
            match parent {
                None => match self.root {
                    Some(first) => {
                        return Err(TreeError::DuplicateRoot {
                            first,
                            second: folder_id,
                        });
                    }
                    None => self.root = Some(folder_id),
                },
                Some(parent_id) => self
                    .nodes
                    .get_mut(&parent_id)
                    .ok_or(TreeError::MissingParent {
                        folder_id,
                        parent_id,
                    })?
                    .children
                    .push(folder_id),
            }
        }
        self.linked = true;
        Ok(())
    }

    pub fn finish(mut self, course: Course) -> Result<CourseTree, TreeError> {
        self.link()?;
        let Some(root_id) = self.root else {
            if self.nodes.is_empty() {
                return Ok(CourseTree { course, root: None });
            }
            return Err(TreeError::MissingRoot(self.nodes.len()));
        };

        let root = assemble(&mut self.nodes, root_id);
        if !self.nodes.is_empty() {
            return Err(TreeError::UnreachableFolders(self.nodes.len()));
        }
        Ok(CourseTree { course, root })
    }
}

fn assemble(nodes: &mut HashMap<u64, PendingFolder>, id: u64) -> Option<TreeFolder> {
    let pending = nodes.remove(&id)?;
    let folders = pending
        .children
        .iter()
        .filter_map(|child| assemble(nodes, *child))
        .collect();
    let mut files = pending.files;
    files.sort_unstable_by_key(|file| file.id);
    Some(TreeFolder {
        folder: pending.folder,
        folders,
        files,
    })
}

/// Drains the folder and file listings of one course into a tree.
///
/// Folder ids that declare files are forwarded on `folder_ids` as soon as
/// their folder arrives. The sender is dropped once the folder listing is
/// exhausted, which lets the file listing stage wind down; the tree is
/// returned after the file listing closes.
pub async fn run_tree_builder(
    course: Course,
    mut folders: mpsc::Receiver<Vec<Folder>>,
    mut files: mpsc::Receiver<Vec<File>>,
    folder_ids: mpsc::Sender<u64>,
    cancel: &CancellationToken,
) -> Result<CourseTree, SyncError> {
    let mut builder = TreeBuilder::new();
    let mut folder_ids = Some(folder_ids);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            batch = folders.recv(), if folder_ids.is_some() => match batch {
                Some(batch) => {
                    let forward = builder.add_folders(batch)?;
                    if let Some(tx) = &folder_ids {
                        for id in forward {
                            send(tx, id, cancel).await?;
                        }
                    }
                }
                None => {
                    builder.link()?;
                    folder_ids = None;
                }
            },
            batch = files.recv() => match batch {
                Some(batch) => builder.add_files(batch)?,
                None => break,
            },
        }
    }

    let tree = builder.finish(course)?;
    tracing::debug!(
        course_id = tree.course.id,
        folders = tree.folders().count(),
        files = tree.file_count(),
        "course tree assembled"
    );
    Ok(tree)
}
