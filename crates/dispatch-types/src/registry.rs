//! Registry trait for self-registering implementations.

/// Declares the configuration name and factory of a pluggable implementation.
///
/// Storage, backend and channel implementations each provide a `Registry`
/// struct implementing this trait, so the service binary can build its
/// factory maps without naming every implementation twice.
pub trait ImplementationRegistry {
	/// Name used under `<section>.implementations.<NAME>` in the TOML config,
	/// e.g. "file" for storage or "http" for the backend.
	const NAME: &'static str;

	/// Factory function type of the owning module.
	type Factory;

	/// Returns the factory function for this implementation.
	fn factory() -> Self::Factory;
}
