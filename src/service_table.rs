//! The service table (C2): a concurrent mapping from service name to the set
//! of edge sites known to run it, plus the local-service-set membership test.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::geo::Point;

/// One edge site advertising a service: its address and coordinates.
/// Identified by IP for set membership, matching the "at most once per IP"
/// invariant on a service's site set.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub(crate) struct Site {
    pub(crate) ip: IpAddr,
    pub(crate) coords: Point,
}

impl PartialEq for Site {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
    }
}

impl Eq for Site {}

impl std::hash::Hash for Site {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state)
    }
}

pub(crate) type SiteSet = HashSet<Site>;

/// Picks, among `sites`, the one closest to `from`. Ties broken by iteration
/// order (first encountered wins), per §4.5 step 4.
pub(crate) fn closest(sites: &SiteSet, from: &Point) -> Option<Site> {
    sites
        .iter()
        .fold(None, |best: Option<(Site, f64)>, site| {
            let d = site.coords.distance(from);
            match best {
                Some((_, best_d)) if best_d <= d => best,
                _ => Some((*site, d)),
            }
        })
        .map(|(site, _)| site)
}

/// Concurrent `service name -> SiteSet` map. Readers never block on writers
/// for more than one lock acquisition; writers install a whole entry or a
/// whole map at a time, never while performing I/O (§4.2).
#[derive(Clone, Default)]
pub(crate) struct ServiceTable {
    inner: Arc<RwLock<HashMap<String, SiteSet>>>,
}

impl ServiceTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the site set for `name`, and whether the key was present.
    pub(crate) async fn lookup(&self, name: &str) -> (SiteSet, bool) {
        let table = self.inner.read().await;
        match table.get(name) {
            Some(sites) => (sites.clone(), true),
            None => (SiteSet::new(), false),
        }
    }

    /// Replaces the entry for `name`; an empty set deletes the key.
    pub(crate) async fn replace(&self, name: String, sites: SiteSet) {
        let mut table = self.inner.write().await;
        if sites.is_empty() {
            table.remove(&name);
        } else {
            table.insert(name, sites);
        }
    }

    /// Atomically replaces the whole table.
    pub(crate) async fn bulk_replace(&self, map: HashMap<String, SiteSet>) {
        let mut table = self.inner.write().await;
        *table = map;
    }

    /// A consistent read-only snapshot of the whole table.
    pub(crate) async fn snapshot(&self) -> HashMap<String, SiteSet> {
        self.inner.read().await.clone()
    }

    pub(crate) async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// The set of service names known to run on this cluster, mutated by the
/// external discovery watcher via the control API (§4.8).
#[derive(Clone, Default)]
pub(crate) struct LocalServiceSet {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl LocalServiceSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.contains(name)
    }

    pub(crate) async fn add(&self, name: String) {
        self.inner.write().await.insert(name);
    }

    pub(crate) async fn remove(&self, name: &str) {
        self.inner.write().await.remove(name);
    }

    pub(crate) async fn replace(&self, names: HashSet<String>) {
        *self.inner.write().await = names;
    }

    pub(crate) async fn snapshot(&self) -> HashSet<String> {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(ip: &str, lat: f64, lon: f64) -> Site {
        Site {
            ip: ip.parse().unwrap(),
            coords: Point::new(lat, lon),
        }
    }

    #[test]
    fn closest_picks_minimum_distance() {
        let mut sites = SiteSet::new();
        sites.insert(site("1.1.1.1", 0.0, 0.0));
        sites.insert(site("2.2.2.2", 60.0, 15.0));

        let own = Point::new(55.0, 13.0);
        assert_eq!(closest(&sites, &own).unwrap().ip, "2.2.2.2".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn lookup_of_absent_key_is_empty() {
        let table = ServiceTable::new();
        let (sites, found) = table.lookup("missing").await;
        assert!(sites.is_empty());
        assert!(!found);
    }

    #[tokio::test]
    async fn replace_with_empty_set_deletes_key() {
        let table = ServiceTable::new();
        let mut sites = SiteSet::new();
        sites.insert(site("1.1.1.1", 0.0, 0.0));
        table.replace("foo".into(), sites).await;
        assert_eq!(table.len().await, 1);

        table.replace("foo".into(), SiteSet::new()).await;
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn bulk_replace_is_atomic_from_a_readers_perspective() {
        let table = ServiceTable::new();
        let mut map = HashMap::new();
        let mut sites = SiteSet::new();
        sites.insert(site("1.1.1.1", 0.0, 0.0));
        map.insert("foo".to_string(), sites);

        table.bulk_replace(map).await;
        let (sites, found) = table.lookup("foo").await;
        assert!(found);
        assert_eq!(sites.len(), 1);
    }

    #[tokio::test]
    async fn local_service_set_membership() {
        let set = LocalServiceSet::new();
        assert!(!set.contains("foo").await);
        set.add("foo".into()).await;
        assert!(set.contains("foo").await);
        set.remove("foo").await;
        assert!(!set.contains("foo").await);
    }
}
