//! Fuzz target for the upload-pack and receive-pack sessions.
//!
//! Feeds arbitrary client input to both services against a small
//! repository. Sessions may fail but must not panic, and a failed push must
//! not move any ref.

#![no_main]

use keel_git::{serve_receive_pack, serve_upload_pack, ServeOptions};
use keel_storage::{Commit, FileMode, GitObject, Repository, Tree, TreeEntry};
use libfuzzer_sys::fuzz_target;

const SIG: &str = "Fuzz <fuzz@example.com> 1700000000 +0000";

fn repository() -> Repository {
    let repo = Repository::in_memory("fuzz");
    let blob = repo
        .objects
        .put(GitObject::blob(b"fuzz\n".to_vec()))
        .expect("memory store");
    let tree = repo
        .objects
        .put_object(Tree::sorted(vec![TreeEntry::new(FileMode::REGULAR, "f", blob)]))
        .expect("memory store");
    let commit = repo
        .objects
        .put_object(Commit::new(tree, vec![], SIG, SIG, "root\n"))
        .expect("memory store");
    repo.refs
        .update("refs/heads/main", None, Some(commit))
        .expect("fresh ref");
    repo
}

fuzz_target!(|data: &[u8]| {
    let repo = repository();
    let options = ServeOptions {
        advertise: false,
        ..ServeOptions::default()
    };

    let _ = serve_upload_pack(data, Vec::new(), &repo, &options);
    let _ = serve_upload_pack(data, Vec::new(), &repo, &ServeOptions::http());

    let before = repo.refs.list();
    if serve_receive_pack(data, Vec::new(), &repo, &options).is_err() {
        assert_eq!(repo.refs.list(), before);
    }
});
