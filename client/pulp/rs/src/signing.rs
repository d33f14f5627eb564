use crate::{Pulp3Client, PulpError, SigningService, from_values};

const SIGNING_SERVICES_PATH: &str =
  "/pulp/api/v3/signing-services/";

pub async fn get_all_signing_services(
  client: &Pulp3Client,
  params: &[(&str, String)],
) -> Result<Vec<SigningService>, PulpError> {
  let values = client
    .get_page_results(SIGNING_SERVICES_PATH, params)
    .await?;
  from_values(values)
}

/// Resolves a signing service handle by name.
pub async fn get_signing_service(
  client: &Pulp3Client,
  name: &str,
) -> Result<SigningService, PulpError> {
  let mut services = get_all_signing_services(
    client,
    &[("name", name.to_string())],
  )
  .await?;
  if services.is_empty() {
    return Err(PulpError::MissingSigningService(name.to_string()));
  }
  Ok(services.remove(0))
}
