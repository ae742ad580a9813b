/*!
# LogGather DevKit - Stubs et utilitaires de test

Bibliothèque facilitant les tests du kernel sans machines distantes ni modèle d'analyse :
- Backends de transport scriptés (commandes et partages) avec enregistrement des appels
- Backend d'analyse scripté (réponses JSON, mode hors-ligne, compteurs)
- Builders de configuration client/kernel
- Harness assemblant un kernel complet sur ces stubs
*/

pub mod analysis_stub;
pub mod fixtures;
pub mod test_utils;
pub mod transport_stub;

pub use analysis_stub::{analysis_json, ScriptedAnalysis};
pub use fixtures::{test_config, ClientBuilder};
pub use test_utils::TestHarness;
pub use transport_stub::{RecordedFetch, Reply, ScriptedTransport};
